// ABOUTME: Heuristics for naming out-of-tree ZMK boards and shields
// ABOUTME: Reads Kconfig and defconfig files to recover names, types and split sides

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use lazy_static::lazy_static;
use regex::Regex;
use thiserror::Error;
use tracing::debug;

lazy_static! {
    static ref BOARD_CONFIG: Regex = Regex::new(r"config BOARD_(\w+)").unwrap();
    static ref MPU_CONFIG: Regex = Regex::new(r"CONFIG_(\w+)_MPU").unwrap();
    static ref GITHUB_SHORTHAND: Regex = Regex::new(r"^([-_\w]+)(?::(.+))?$").unwrap();
}

#[derive(Error, Debug)]
pub enum KeyboardError {
    #[error("could not guess board name from `{0}`")]
    UnknownBoardName(PathBuf),
    #[error("could not guess board type from `{0}`")]
    UnknownBoardType(PathBuf),
    #[error("not a ZMK source: `{0}`")]
    InvalidSource(String),
}

/// Shield name guessed from the first `*.keymap` file in the directory,
/// falling back to the directory name itself.
pub fn guess_shield_name(shield_dir: &Path) -> String {
    if let Ok(entries) = fs::read_dir(shield_dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "keymap") {
                if let Some(stem) = path.file_stem() {
                    return stem.to_string_lossy().into_owned();
                }
            }
        }
    }
    shield_dir
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Board name from the first `config BOARD_…` entry in `Kconfig.board`.
pub fn guess_board_name(board_dir: &Path) -> Result<String, KeyboardError> {
    let text = fs::read_to_string(board_dir.join("Kconfig.board"))
        .map_err(|_| KeyboardError::UnknownBoardName(board_dir.to_path_buf()))?;
    BOARD_CONFIG
        .captures(&text)
        .map(|captures| captures[1].to_lowercase())
        .ok_or_else(|| KeyboardError::UnknownBoardName(board_dir.to_path_buf()))
}

/// Board architecture from the first `CONFIG_…_MPU` entry in any
/// `*_defconfig` file, e.g. `arm`.
pub fn guess_board_type(board_dir: &Path) -> Result<String, KeyboardError> {
    let entries =
        fs::read_dir(board_dir).map_err(|_| KeyboardError::UnknownBoardType(board_dir.to_path_buf()))?;
    for entry in entries.flatten() {
        let path = entry.path();
        let is_defconfig = path
            .file_name()
            .is_some_and(|name| name.to_string_lossy().ends_with("_defconfig"));
        if !is_defconfig {
            continue;
        }
        if let Ok(text) = fs::read_to_string(&path) {
            if let Some(captures) = MPU_CONFIG.captures(&text) {
                return Ok(captures[1].to_lowercase());
            }
        }
    }
    Err(KeyboardError::UnknownBoardType(board_dir.to_path_buf()))
}

/// Split-shield sides declared in `Kconfig.defconfig` as
/// `SHIELD_<NAME>_<side>` symbols, lowercased; typically `left` and `right`.
/// An unreadable or absent `Kconfig.defconfig` means "not split".
pub fn split_shield_sides(shield_dir: &Path, shield_name: &str) -> BTreeSet<String> {
    let Ok(text) = fs::read_to_string(shield_dir.join("Kconfig.defconfig")) else {
        return BTreeSet::new();
    };
    let Ok(pattern) = Regex::new(&format!(
        r"(?i)SHIELD_{}_(\w+)",
        regex::escape(shield_name)
    )) else {
        return BTreeSet::new();
    };
    let sides: BTreeSet<String> = pattern
        .captures_iter(&text)
        .map(|captures| captures[1].to_lowercase())
        .collect();
    if !sides.is_empty() {
        debug!(
            "guessing shield `{shield_name}` is split ({})",
            sides.iter().cloned().collect::<Vec<_>>().join(", ")
        );
    }
    sides
}

/// Where the ZMK source tree comes from: a local checkout mounted into the
/// sandbox, or a GitHub repository cloned at image-build time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ZmkSource {
    LocalTree(PathBuf),
    GitHub { repo_url: String, branch: String },
}

impl ZmkSource {
    /// Parse a `user[:branch]` GitHub shorthand; an existing local directory
    /// wins over the shorthand reading.
    pub fn parse(text: &str) -> Result<Self, KeyboardError> {
        let path = Path::new(text);
        if path.is_dir() {
            return Ok(Self::LocalTree(path.to_path_buf()));
        }
        let captures = GITHUB_SHORTHAND
            .captures(text)
            .ok_or_else(|| KeyboardError::InvalidSource(text.to_string()))?;
        Ok(Self::GitHub {
            repo_url: format!("https://github.com/{}/zmk.git", &captures[1]),
            branch: captures
                .get(2)
                .map(|branch| branch.as_str().to_string())
                .unwrap_or_else(|| "main".to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[test]
    fn shield_name_comes_from_the_keymap_file() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("corne.keymap"), "").unwrap();
        fs::write(dir.path().join("corne.conf"), "").unwrap();
        assert_eq!(guess_shield_name(dir.path()), "corne");
    }

    #[test]
    fn shield_name_falls_back_to_the_directory_name() {
        let dir = TempDir::new().unwrap();
        let shield = dir.path().join("lily58");
        fs::create_dir(&shield).unwrap();
        assert_eq!(guess_shield_name(&shield), "lily58");
    }

    #[test]
    fn board_name_is_read_from_kconfig_board() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("Kconfig.board"),
            "config BOARD_NICE_NANO_V2\n\tbool \"nice!nano v2\"\n",
        )
        .unwrap();
        assert_eq!(guess_board_name(dir.path()).unwrap(), "nice_nano_v2");
    }

    #[test]
    fn missing_kconfig_board_is_an_error() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            guess_board_name(dir.path()),
            Err(KeyboardError::UnknownBoardName(_))
        ));
    }

    #[test]
    fn board_type_is_read_from_a_defconfig() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("nice_nano_v2_defconfig"),
            "CONFIG_SOC_SERIES_NRF52X=y\nCONFIG_ARM_MPU=y\n",
        )
        .unwrap();
        assert_eq!(guess_board_type(dir.path()).unwrap(), "arm");
    }

    #[test]
    fn board_type_without_mpu_hint_is_an_error() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("foo_defconfig"), "CONFIG_SOC=y\n").unwrap();
        assert!(matches!(
            guess_board_type(dir.path()),
            Err(KeyboardError::UnknownBoardType(_))
        ));
    }

    #[test]
    fn split_sides_are_collected_case_insensitively() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("Kconfig.defconfig"),
            "if SHIELD_CORNE_LEFT\nendif\nif SHIELD_CORNE_RIGHT\nendif\n",
        )
        .unwrap();
        let sides = split_shield_sides(dir.path(), "corne");
        assert_eq!(
            sides.into_iter().collect::<Vec<_>>(),
            vec!["left".to_string(), "right".to_string()]
        );
    }

    #[test]
    fn non_split_shield_has_no_sides() {
        let dir = TempDir::new().unwrap();
        assert!(split_shield_sides(dir.path(), "corne").is_empty());
    }

    #[test]
    fn github_shorthand_parses_user_and_branch() {
        assert_eq!(
            ZmkSource::parse("zmkfirmware:main").unwrap(),
            ZmkSource::GitHub {
                repo_url: "https://github.com/zmkfirmware/zmk.git".to_string(),
                branch: "main".to_string(),
            }
        );
        assert_eq!(
            ZmkSource::parse("someuser").unwrap(),
            ZmkSource::GitHub {
                repo_url: "https://github.com/someuser/zmk.git".to_string(),
                branch: "main".to_string(),
            }
        );
    }

    #[test]
    fn local_directory_wins_over_the_shorthand() {
        let dir = TempDir::new().unwrap();
        let parsed = ZmkSource::parse(&dir.path().to_string_lossy()).unwrap();
        assert_eq!(parsed, ZmkSource::LocalTree(dir.path().to_path_buf()));
    }
}
