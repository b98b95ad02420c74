// ABOUTME: Turns parsed arguments into a sandbox invocation and drives it to completion
// ABOUTME: Volume assembly, Dockerfile selection, build + run, artefact retrieval report

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use anyhow::{bail, Context, Result};
use bollard::Docker;
use hermit_sandbox::{
    BuildContext, ContainerRunner, DeviceMap, ImageBuildRequest, ImageBuilder, RunOptions,
    RunRequest, VolumeMap, VolumeMode,
};
use hermit_zmk::{
    build_script, compilation_items, guess_board_name, guess_board_type, guess_shield_name,
    BuildScriptArgs, SideFilter, ZmkSource,
};
use tracing::{error, info};

use crate::args::Args;

/// Sandbox-side paths; the volume map binds host directories onto these.
const ZMK_USER: &str = "zmkuser";
const ZMK_HOME: &str = "/home/zmkuser/zmk";
const ZMK_CONFIG: &str = "/zmk-config";
const ARTEFACTS: &str = "/artefacts";
const BUILD: &str = "/tmp/zmk-build";

const IMAGE_TAG: &str = "zmk-hermit";
const DOCKERFILE_GIT_SRC: &str = include_str!("../dockerfiles/Dockerfile.git-src");
const DOCKERFILE_LOCAL_SRC: &str = include_str!("../dockerfiles/Dockerfile.local-src");

/// Everything needed to build the image and run the sandboxed build.
struct Invocation {
    dockerfile: &'static str,
    image_args: Vec<(String, String)>,
    volumes: VolumeMap,
    command: Vec<String>,
    user: u32,
    output_basename: String,
    artefact_dir: PathBuf,
    extensions: Vec<String>,
}

/// Exit-code policy: configuration errors exit 2, engine failures 1,
/// interruption 130, and otherwise the container command's own exit code.
pub async fn run(args: Args) -> i32 {
    let invocation = match assemble(&args) {
        Ok(invocation) => invocation,
        Err(e) => {
            error!("error: {e:#}");
            return 2;
        }
    };

    if args.dry_run {
        return match print_plan(&invocation) {
            Ok(()) => 0,
            Err(e) => {
                error!("error: {e:#}");
                2
            }
        };
    }

    let start = SystemTime::now();
    let interrupted = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&interrupted);
    let shutdown = async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            flag.store(true, Ordering::SeqCst);
        }
    };

    let artefact_dir = invocation.artefact_dir.clone();
    let output_basename = invocation.output_basename.clone();
    let extensions = invocation.extensions.clone();

    match execute(invocation, shutdown).await {
        Ok(exit_code) => {
            if interrupted.load(Ordering::SeqCst) {
                return 130;
            }
            if exit_code == 0 {
                report_artefacts(&artefact_dir, &output_basename, &extensions, start);
            }
            exit_code as i32
        }
        Err(e) => {
            error!("error: {e:#}");
            1
        }
    }
}

fn assemble(args: &Args) -> Result<Invocation> {
    let mut volumes = VolumeMap::new();
    let (shield_arg, board_arg) = args.keyboard();

    if let Some(config) = &args.zmk_config {
        if !config.is_dir() {
            bail!("zmk-config must be a directory");
        }
        volumes.insert(ZMK_CONFIG, config.clone(), VolumeMode::ReadOnly);
    }

    // An existing path means an out-of-tree shield that gets mounted into
    // zmk-config; otherwise the argument is taken as an in-tree name.
    let (shield_name, shield_dir) = match shield_arg {
        Some(text) => {
            let path = Path::new(text);
            if path.is_dir() || path.is_file() {
                let dir = if path.is_dir() {
                    path.to_path_buf()
                } else {
                    path.parent().unwrap_or(Path::new(".")).to_path_buf()
                };
                let name = guess_shield_name(&dir);
                info!("guessed shield name `{name}` from `{}`", path.display());
                volumes.insert(
                    Path::new(ZMK_CONFIG).join("boards/shields").join(&name),
                    dir.clone(),
                    VolumeMode::ReadOnly,
                );
                (Some(name), Some(dir))
            } else {
                let in_config = args
                    .zmk_config
                    .as_ref()
                    .map(|config| config.join("boards/shields").join(text))
                    .filter(|candidate| candidate.is_dir());
                (Some(text.to_string()), in_config)
            }
        }
        None => (None, None),
    };

    let Some(board_arg) = board_arg else {
        bail!("no board");
    };
    let board_path = Path::new(board_arg);
    let board_name = if board_path.is_dir() {
        let name = guess_board_name(board_path)?;
        let board_type = guess_board_type(board_path)?;
        info!(
            "guessed board name `{name}` ({board_type}) from `{}`",
            board_path.display()
        );
        volumes.insert(
            Path::new(ZMK_CONFIG).join("boards").join(board_type).join(&name),
            board_path.to_path_buf(),
            VolumeMode::ReadOnly,
        );
        name
    } else if board_path.is_file() {
        bail!("out-of-tree board must be a directory");
    } else {
        board_arg.to_string()
    };

    let keymap_name = match &args.keymap {
        Some(keymap) => {
            if !keymap.is_file() {
                bail!("out-of-tree keymap must be a file");
            }
            let stem = keymap
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
                .unwrap_or_default();
            let owner = shield_name.as_deref().unwrap_or(&board_name);
            volumes.insert(
                Path::new(ZMK_CONFIG).join(format!("{owner}.keymap")),
                keymap.clone(),
                VolumeMode::ReadOnly,
            );
            Some(stem)
        }
        None => None,
    };

    let output_basename = [
        shield_name.as_deref(),
        Some(board_name.as_str()),
        keymap_name.as_deref(),
    ]
    .iter()
    .filter_map(|part| *part)
    .collect::<Vec<_>>()
    .join("-");

    if !args.into.is_dir() {
        bail!("output directory not a directory");
    }
    volumes.insert(ARTEFACTS, args.into.clone(), VolumeMode::ReadWrite);

    // Behavior source files are overlaid into their in-tree homes, so the
    // build sees them as if they had been committed to the ZMK checkout.
    let behavior_bases: BTreeSet<PathBuf> = args
        .behaviors
        .iter()
        .map(|path| path.with_extension(""))
        .collect();
    for base in behavior_bases {
        let Some(name) = base.file_name().map(|name| name.to_string_lossy().into_owned()) else {
            continue;
        };
        for (host, in_tree) in behavior_overlay_files(&base, &name) {
            if host.is_file() {
                volumes.insert(
                    Path::new(ZMK_HOME).join(in_tree),
                    host,
                    VolumeMode::ReadOnly,
                );
            }
        }
    }

    if let Some(build_dir) = &args.build_dir {
        if !build_dir.is_dir() {
            bail!("build directory not a directory");
        }
        volumes.insert(BUILD, build_dir.clone(), VolumeMode::ReadWrite);
    }

    let (dockerfile, git_source) = match ZmkSource::parse(&args.zmk)? {
        ZmkSource::LocalTree(tree) => {
            volumes.insert(ZMK_HOME, tree, VolumeMode::ReadWrite);
            (DOCKERFILE_LOCAL_SRC, None)
        }
        ZmkSource::GitHub { repo_url, branch } => (DOCKERFILE_GIT_SRC, Some((repo_url, branch))),
    };

    let side_filter = if args.left_only {
        SideFilter::LeftOnly
    } else if args.right_only {
        SideFilter::RightOnly
    } else {
        SideFilter::All
    };
    let items = compilation_items(
        &board_name,
        shield_name.as_deref(),
        shield_dir.as_deref(),
        side_filter,
    );
    // Shield, board and keymap mounts all materialize under /zmk-config, so
    // the build gets pointed at it whenever any of them is present.
    let uses_zmk_config = volumes
        .iter()
        .any(|(destination, _, _)| destination.starts_with(ZMK_CONFIG));
    let script = build_script(
        &items,
        &BuildScriptArgs {
            zmk_home: Path::new(ZMK_HOME),
            zmk_config: uses_zmk_config.then(|| Path::new(ZMK_CONFIG)),
            build_root: Path::new(BUILD),
            artefacts: Some(Path::new(ARTEFACTS)),
            extensions: &args.extensions,
            alias: Some(&output_basename),
            pristine: args.pristine,
            side_filter,
            extra_args: &args.west_args,
        },
    );

    Ok(Invocation {
        dockerfile,
        image_args: image_args(&args.zmk_image, git_source.as_ref()),
        volumes,
        command: vec!["sh".to_string(), "-c".to_string(), script],
        user: nix::unistd::getuid().as_raw(),
        output_basename,
        artefact_dir: args.into.clone(),
        extensions: args.extensions.clone(),
    })
}

/// The four in-tree homes of one out-of-tree behavior, keyed by extension.
fn behavior_overlay_files(base: &Path, name: &str) -> [(PathBuf, String); 4] {
    [
        (
            base.with_extension("c"),
            format!("app/src/behaviors/behavior_{name}.c"),
        ),
        (
            base.with_extension("yaml"),
            format!("app/dts/bindings/behaviors/zmk,behavior-{name}.yaml"),
        ),
        (
            base.with_extension("dtsi"),
            format!("app/dts/behaviors/{name}.dtsi"),
        ),
        (
            base.with_extension("h"),
            format!("app/include/dt-bindings/zmk/{name}.h"),
        ),
    ]
}

fn image_args(zmk_image: &str, git: Option<&(String, String)>) -> Vec<(String, String)> {
    let mut args = vec![("ZMK_IMAGE".to_string(), zmk_image.to_string())];
    if let Some((repo_url, branch)) = git {
        args.push(("ZMK_GIT".to_string(), repo_url.clone()));
        args.push(("ZMK_GIT_BRANCH".to_string(), branch.clone()));
    }
    args.push(("UID".to_string(), nix::unistd::getuid().as_raw().to_string()));
    args.push(("GID".to_string(), nix::unistd::getgid().as_raw().to_string()));
    args.push(("USER".to_string(), ZMK_USER.to_string()));
    args
}

fn print_plan(invocation: &Invocation) -> Result<()> {
    println!("would build image `{IMAGE_TAG}` with:");
    for (name, value) in &invocation.image_args {
        println!("  {name}={value}");
    }
    println!("would run as uid {} with mounts:", invocation.user);
    let resolved = invocation.volumes.clone().resolve_overlaps()?;
    for bind in resolved.bindings() {
        println!("  {bind}");
    }
    println!("would run:");
    if let Some(script) = invocation.command.last() {
        for line in script.lines() {
            println!("  {line}");
        }
    }
    Ok(())
}

async fn execute(
    invocation: Invocation,
    shutdown: impl std::future::Future<Output = ()>,
) -> Result<i64> {
    let client = Docker::connect_with_defaults().context("connecting to Docker")?;

    info!("building image...");
    let builder = ImageBuilder::with_client(client.clone());
    let image = builder
        .build(
            ImageBuildRequest {
                context: BuildContext::from_dockerfile(invocation.dockerfile)?,
                build_args: invocation.image_args,
                tag: Some(IMAGE_TAG.to_string()),
            },
            tokio::io::stdout(),
        )
        .await?;

    info!("running container...");
    let runner = ContainerRunner::with_client(client);
    let outcome = runner
        .run(
            RunRequest {
                image,
                command: invocation.command,
                volumes: invocation.volumes,
                devices: DeviceMap::new(),
                user: Some(invocation.user),
                options: RunOptions::default(),
            },
            tokio::io::stdout(),
            shutdown,
        )
        .await?;
    Ok(outcome.exit_code)
}

/// Report artefacts that the run just produced: right basename, requested
/// extension, modified after the run started.
fn report_artefacts(dir: &Path, basename: &str, extensions: &[String], since: SystemTime) {
    let Ok(entries) = dir.read_dir() else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().into_owned();
        let extension = path
            .extension()
            .map(|extension| extension.to_string_lossy().into_owned())
            .unwrap_or_default();
        let fresh = entry
            .metadata()
            .and_then(|metadata| metadata.modified())
            .map(|modified| modified > since)
            .unwrap_or(false);
        if name.starts_with(basename) && extensions.contains(&extension) && fresh {
            info!("retrieved `{}`", path.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use std::fs;
    use tempfile::TempDir;

    fn parse(args: &[&str]) -> Args {
        Args::parse_from(std::iter::once("zmk-hermit").chain(args.iter().copied()))
    }

    #[test]
    fn out_of_tree_shield_is_mounted_into_zmk_config() {
        let shield = TempDir::new().unwrap();
        fs::write(shield.path().join("corne.keymap"), "").unwrap();

        let shield_arg = shield.path().to_string_lossy().into_owned();
        let invocation = assemble(&parse(&[&shield_arg, "nice_nano_v2"])).unwrap();

        let (source, _) = invocation
            .volumes
            .get("/zmk-config/boards/shields/corne")
            .expect("shield mount");
        assert_eq!(source, shield.path());
        assert_eq!(invocation.output_basename, "corne-nice_nano_v2");
    }

    #[test]
    fn out_of_tree_board_is_mounted_by_guessed_type_and_name() {
        let board = TempDir::new().unwrap();
        fs::write(
            board.path().join("Kconfig.board"),
            "config BOARD_MYBOARD\n",
        )
        .unwrap();
        fs::write(
            board.path().join("myboard_defconfig"),
            "CONFIG_ARM_MPU=y\n",
        )
        .unwrap();

        let board_arg = board.path().to_string_lossy().into_owned();
        let invocation = assemble(&parse(&[&board_arg])).unwrap();

        assert!(invocation
            .volumes
            .get("/zmk-config/boards/arm/myboard")
            .is_some());
        assert_eq!(invocation.output_basename, "myboard");
    }

    #[test]
    fn keymap_is_named_after_the_shield() {
        let dir = TempDir::new().unwrap();
        let keymap = dir.path().join("custom.keymap");
        fs::write(&keymap, "").unwrap();

        let keymap_arg = keymap.to_string_lossy().into_owned();
        let invocation =
            assemble(&parse(&["corne", "nice_nano_v2", "--keymap", &keymap_arg])).unwrap();

        assert!(invocation.volumes.get("/zmk-config/corne.keymap").is_some());
        assert_eq!(invocation.output_basename, "corne-nice_nano_v2-custom");
    }

    #[test]
    fn behavior_files_are_overlaid_into_their_in_tree_homes() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("magic.c"), "").unwrap();
        fs::write(dir.path().join("magic.dtsi"), "").unwrap();

        let behavior_arg = dir.path().join("magic.c").to_string_lossy().into_owned();
        let invocation =
            assemble(&parse(&["planck", "--behavior", &behavior_arg])).unwrap();

        assert!(invocation
            .volumes
            .get("/home/zmkuser/zmk/app/src/behaviors/behavior_magic.c")
            .is_some());
        assert!(invocation
            .volumes
            .get("/home/zmkuser/zmk/app/dts/behaviors/magic.dtsi")
            .is_some());
        // No .yaml or .h files exist, so no mounts for them.
        assert!(invocation
            .volumes
            .get("/home/zmkuser/zmk/app/include/dt-bindings/zmk/magic.h")
            .is_none());
    }

    #[test]
    fn local_zmk_tree_selects_the_local_src_dockerfile() {
        let tree = TempDir::new().unwrap();
        let tree_arg = tree.path().to_string_lossy().into_owned();
        let invocation = assemble(&parse(&["planck", "--zmk", &tree_arg])).unwrap();

        assert!(invocation.dockerfile.contains("bind-mounted"));
        assert!(invocation.volumes.get(ZMK_HOME).is_some());
        assert!(!invocation
            .image_args
            .iter()
            .any(|(name, _)| name == "ZMK_GIT"));
    }

    #[test]
    fn github_shorthand_selects_the_git_src_dockerfile() {
        let invocation = assemble(&parse(&["planck", "--zmk", "someuser:dev"])).unwrap();

        assert!(invocation.dockerfile.contains("git clone"));
        assert!(invocation.image_args.contains(&(
            "ZMK_GIT".to_string(),
            "https://github.com/someuser/zmk.git".to_string()
        )));
        assert!(invocation
            .image_args
            .contains(&("ZMK_GIT_BRANCH".to_string(), "dev".to_string())));
    }

    #[test]
    fn missing_board_is_a_usage_error() {
        let args = Args::parse_from(["zmk-hermit"]);
        assert!(assemble(&args).is_err());
    }

    #[test]
    fn nonexistent_zmk_config_is_a_usage_error() {
        let args = parse(&["planck", "--zmk-config", "/no/such/dir"]);
        assert!(assemble(&args).is_err());
    }

    #[test]
    fn in_tree_shield_by_name_probes_split_sides_in_the_container() {
        let invocation = assemble(&parse(&["corne", "nice_nano_v2"])).unwrap();
        let script = &invocation.command[2];

        assert!(script.contains("app/boards/shields/corne/Kconfig.defconfig"));
        assert!(script.contains("for side in $sides; do"));
        assert!(script.contains(r#"'-DSHIELD=corne_'"$side""#));

        let left = assemble(&parse(&["corne", "nice_nano_v2", "--left-only"])).unwrap();
        assert!(left.command[2].contains(r#"[ "$side" = left ] || continue"#));
    }

    #[test]
    fn build_command_runs_through_sh() {
        let invocation = assemble(&parse(&["corne", "nice_nano_v2"])).unwrap();
        assert_eq!(&invocation.command[..2], ["sh", "-c"]);
        assert!(invocation.command[2].contains("west build -b nice_nano_v2"));
        assert!(invocation.command[2].contains("-DSHIELD=corne"));
    }
}
