// ABOUTME: Build-plan generation: compilation items, west commands, in-container script
// ABOUTME: Turns board/shield/side combinations into the shell program run in the sandbox

use std::path::Path;

use crate::keyboard::split_shield_sides;

/// One firmware to compile: a board, optionally a shield, optionally one
/// side of a split shield.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompilationItem {
    /// Valid ZMK board name, e.g. `nice_nano_v2`.
    pub board: String,
    /// Shield name without a side suffix, e.g. `corne`.
    pub shield_name: Option<String>,
    /// `left` or `right` for split shields.
    pub shield_side: Option<String>,
}

impl CompilationItem {
    /// Shield name as west wants it, side-suffixed for splits, e.g.
    /// `corne_left`.
    pub fn zmk_shield(&self) -> Option<String> {
        let name = self.shield_name.as_deref()?;
        Some(match self.shield_side.as_deref() {
            Some(side) => format!("{name}_{side}"),
            None => name.to_string(),
        })
    }

    /// Artefact file name: `shield-board[.side].ext`, or
    /// `alias[.side].ext` when an alias overrides the basename.
    pub fn artefact_name(&self, alias: Option<&str>, extension: &str) -> String {
        let basename = match alias {
            Some(alias) => alias.to_string(),
            None => join_some(&[self.shield_name.as_deref(), Some(&self.board)], "-"),
        };
        join_some(
            &[Some(&basename), self.shield_side.as_deref(), Some(extension)],
            ".",
        )
    }
}

/// Which split sides to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SideFilter {
    #[default]
    All,
    LeftOnly,
    RightOnly,
}

impl SideFilter {
    fn admits(self, side: &str) -> bool {
        match self {
            SideFilter::All => true,
            SideFilter::LeftOnly => side == "left",
            SideFilter::RightOnly => side == "right",
        }
    }

    fn required_side(self) -> Option<&'static str> {
        match self {
            SideFilter::All => None,
            SideFilter::LeftOnly => Some("left"),
            SideFilter::RightOnly => Some("right"),
        }
    }
}

/// One compilation item per split side the shield directory reveals, or a
/// single item for non-split shields and bare boards.
///
/// A side-less item for a named shield does not mean "not split": when no
/// host-side shield directory is available the sides are only discoverable
/// inside the sandbox, and [`build_script`] probes for them at run time.
pub fn compilation_items(
    board: &str,
    shield: Option<&str>,
    shield_dir: Option<&Path>,
    filter: SideFilter,
) -> Vec<CompilationItem> {
    let single = |side: Option<String>| CompilationItem {
        board: board.to_string(),
        shield_name: shield.map(str::to_owned),
        shield_side: side,
    };

    let Some(shield_name) = shield else {
        return vec![single(None)];
    };
    let sides = shield_dir
        .map(|dir| split_shield_sides(dir, shield_name))
        .unwrap_or_default();
    if sides.is_empty() {
        return vec![single(None)];
    }
    sides
        .into_iter()
        .filter(|side| filter.admits(side))
        .map(|side| single(Some(side)))
        .collect()
}

/// Optional pieces of a `west build` invocation.
#[derive(Debug, Clone, Default)]
pub struct WestBuildArgs<'a> {
    pub app_dir: Option<&'a Path>,
    pub build_dir: Option<&'a Path>,
    pub zmk_config: Option<&'a Path>,
    pub pristine: bool,
    pub extra_args: &'a [String],
}

/// The `west build` command line for one compilation item. Extra arguments
/// go to west itself; the CMake definitions always come last, after `--`.
pub fn west_build_command(
    board: &str,
    shield: Option<&str>,
    args: &WestBuildArgs<'_>,
) -> Vec<String> {
    let mut command = vec![
        "west".to_string(),
        "build".to_string(),
        "-b".to_string(),
        board.to_string(),
        "--pristine".to_string(),
        if args.pristine { "always" } else { "auto" }.to_string(),
    ];
    if let Some(app_dir) = args.app_dir {
        command.push("-s".to_string());
        command.push(app_dir.display().to_string());
    }
    if let Some(build_dir) = args.build_dir {
        command.push("-d".to_string());
        command.push(build_dir.display().to_string());
    }
    command.extend(args.extra_args.iter().cloned());

    let mut cmake_args = Vec::new();
    if let Some(shield) = shield {
        cmake_args.push(format!("-DSHIELD={shield}"));
    }
    if let Some(zmk_config) = args.zmk_config {
        cmake_args.push(format!("-DZMK_CONFIG={}", zmk_config.display()));
    }
    if !cmake_args.is_empty() {
        command.push("--".to_string());
        command.extend(cmake_args);
    }
    command
}

/// Everything the in-container build script needs to know, in sandbox paths.
#[derive(Debug, Clone)]
pub struct BuildScriptArgs<'a> {
    /// ZMK checkout inside the sandbox; the west workspace root.
    pub zmk_home: &'a Path,
    pub zmk_config: Option<&'a Path>,
    /// Root under which per-item build directories are created.
    pub build_root: &'a Path,
    /// Where compiled artefacts are copied; `None` skips retrieval.
    pub artefacts: Option<&'a Path>,
    pub extensions: &'a [String],
    /// Basename override for artefact files.
    pub alias: Option<&'a str>,
    pub pristine: bool,
    /// Split-side restriction, applied to sides discovered at run time.
    pub side_filter: SideFilter,
    pub extra_args: &'a [String],
}

/// The single `sh -c` program run inside the sandbox: make sure the west
/// workspace is usable, then build every item and copy its artefacts out.
/// A missing artefact warns instead of failing the whole run.
///
/// An item carrying a shield name but no side had no host-visible shield
/// directory; its sides, if any, live in the ZMK app tree that only exists
/// inside the sandbox. For such items the script reads the shield's
/// `Kconfig.defconfig` under `<zmk_home>/app/boards/shields/<name>` at run
/// time and builds one firmware per discovered side, falling back to a
/// plain single build when none turn up.
pub fn build_script(items: &[CompilationItem], args: &BuildScriptArgs<'_>) -> String {
    let app_dir = args.zmk_home.join("app");
    let mut lines = vec![
        "set -e".to_string(),
        format!("cd {}", sh_quote(&args.zmk_home.display().to_string())),
        "if ! west --help build >/dev/null 2>&1; then".to_string(),
        format!(
            "    west init -l {} || true",
            sh_quote(&app_dir.display().to_string())
        ),
        "    west update".to_string(),
        "    west zephyr-export".to_string(),
        "fi".to_string(),
    ];

    for item in items {
        match item.shield_name.as_deref() {
            Some(shield) if item.shield_side.is_none() => {
                push_probed_build(&mut lines, shield, item, args, &app_dir);
            }
            _ => push_build(&mut lines, item, args, &app_dir, ""),
        }
    }
    lines.join("\n")
}

fn push_build(
    lines: &mut Vec<String>,
    item: &CompilationItem,
    args: &BuildScriptArgs<'_>,
    app_dir: &Path,
    indent: &str,
) {
    let zmk_shield = item.zmk_shield();
    let build_dir = args.build_root.join(join_some(
        &[zmk_shield.as_deref(), Some(&item.board)],
        "-",
    ));
    let command = west_build_command(
        &item.board,
        zmk_shield.as_deref(),
        &WestBuildArgs {
            app_dir: Some(app_dir),
            build_dir: Some(&build_dir),
            zmk_config: args.zmk_config,
            pristine: args.pristine,
            extra_args: args.extra_args,
        },
    );
    lines.push(format!("{indent}{}", sh_join(&command)));

    if let Some(artefacts) = args.artefacts {
        for extension in args.extensions {
            let compiled = build_dir.join("zephyr").join(format!("zmk.{extension}"));
            let retrieved = artefacts.join(item.artefact_name(args.alias, extension));
            let compiled = sh_quote(&compiled.display().to_string());
            let retrieved = sh_quote(&retrieved.display().to_string());
            lines.push(format!(
                "{indent}if [ -f {compiled} ]; then cp {compiled} {retrieved}; \
                 else echo \"no zmk.{extension} artefact in {}\" >&2; fi",
                build_dir.display()
            ));
        }
    }
}

/// Emit a build whose split sides are discovered inside the sandbox.
fn push_probed_build(
    lines: &mut Vec<String>,
    shield: &str,
    item: &CompilationItem,
    args: &BuildScriptArgs<'_>,
    app_dir: &Path,
) {
    let kconfig = app_dir
        .join("boards/shields")
        .join(shield)
        .join("Kconfig.defconfig");
    let kconfig = sh_quote(&kconfig.display().to_string());
    let symbol_prefix = format!("SHIELD_{}_", shield.to_uppercase());

    lines.push("sides=''".to_string());
    lines.push(format!("if [ -f {kconfig} ]; then"));
    lines.push(format!(
        "    sides=$(grep -oiE '{symbol_prefix}[A-Za-z0-9_]+' {kconfig} \
         | cut -c {}- | tr '[:upper:]' '[:lower:]' | sort -u)",
        symbol_prefix.len() + 1
    ));
    lines.push("fi".to_string());
    lines.push("if [ -n \"$sides\" ]; then".to_string());
    lines.push("    for side in $sides; do".to_string());
    if let Some(required) = args.side_filter.required_side() {
        lines.push(format!("        [ \"$side\" = {required} ] || continue"));
    }

    let base = west_build_command(
        &item.board,
        None,
        &WestBuildArgs {
            app_dir: Some(app_dir),
            build_dir: None,
            zmk_config: None,
            pristine: args.pristine,
            extra_args: args.extra_args,
        },
    );
    let build_dir = sided_expr(
        &format!("{}/{}_", args.build_root.display(), shield),
        &format!("-{}", item.board),
    );
    let mut west = format!(
        "        {} -d {} -- {}",
        sh_join(&base),
        build_dir,
        sided_expr(&format!("-DSHIELD={shield}_"), "")
    );
    if let Some(config) = args.zmk_config {
        west.push(' ');
        west.push_str(&quote_arg(&format!("-DZMK_CONFIG={}", config.display())));
    }
    lines.push(west);

    if let Some(artefacts) = args.artefacts {
        let basename = match args.alias {
            Some(alias) => alias.to_string(),
            None => join_some(&[Some(shield), Some(&item.board)], "-"),
        };
        for extension in args.extensions {
            let compiled = sided_expr(
                &format!("{}/{}_", args.build_root.display(), shield),
                &format!("-{}/zephyr/zmk.{extension}", item.board),
            );
            let retrieved = sided_expr(
                &format!("{}/{}.", artefacts.display(), basename),
                &format!(".{extension}"),
            );
            lines.push(format!(
                "        if [ -f {compiled} ]; then cp {compiled} {retrieved}; \
                 else echo \"no zmk.{extension} artefact for shield side $side\" >&2; fi"
            ));
        }
    }
    lines.push("    done".to_string());
    lines.push("else".to_string());
    push_build(lines, item, args, app_dir, "    ");
    lines.push("fi".to_string());
}

/// A word built from a quoted prefix, the shell's `$side`, and a quoted
/// suffix, e.g. `'corne_'"$side"'-board'`.
fn sided_expr(prefix: &str, suffix: &str) -> String {
    let mut expr = format!("{}\"$side\"", sh_quote(prefix));
    if !suffix.is_empty() {
        expr.push_str(&sh_quote(suffix));
    }
    expr
}

/// Join an argv into one shell line, quoting every word `sh` would re-split
/// or expand.
fn sh_join(command: &[String]) -> String {
    command
        .iter()
        .map(|arg| quote_arg(arg))
        .collect::<Vec<_>>()
        .join(" ")
}

fn quote_arg(arg: &str) -> String {
    let safe = !arg.is_empty()
        && arg.bytes().all(|b| {
            b.is_ascii_alphanumeric()
                || matches!(b, b'_' | b'-' | b'.' | b'/' | b'=' | b':' | b',' | b'+' | b'@')
        });
    if safe {
        arg.to_string()
    } else {
        sh_quote(arg)
    }
}

/// Single-quote a string for `sh`, escaping embedded quotes.
fn sh_quote(text: &str) -> String {
    format!("'{}'", text.replace('\'', r"'\''"))
}

fn join_some(parts: &[Option<&str>], separator: &str) -> String {
    parts
        .iter()
        .filter_map(|part| *part)
        .collect::<Vec<_>>()
        .join(separator)
}
