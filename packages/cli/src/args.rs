// ABOUTME: Command-line argument definitions for zmk-hermit
// ABOUTME: Names or out-of-tree paths for the keyboard, output policy, ZMK source selection

use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "zmk-hermit")]
#[command(about = "Compile out-of-tree ZMK keyboards in a disposable Docker container")]
#[command(after_help = "Extra arguments after `--` are passed to `west build`.")]
#[command(version)]
pub struct Args {
    /// ZMK shield name or out-of-tree shield directory
    #[arg(value_name = "SHIELD", help_heading = "Keyboard")]
    pub shield: Option<String>,

    /// ZMK board name or out-of-tree board directory
    #[arg(value_name = "BOARD", help_heading = "Keyboard")]
    pub board: Option<String>,

    /// Out-of-tree keymap file
    #[arg(long, value_name = "FILE", help_heading = "Keyboard")]
    pub keymap: Option<PathBuf>,

    /// zmk-config directory
    #[arg(long, value_name = "DIR", help_heading = "Keyboard")]
    pub zmk_config: Option<PathBuf>,

    /// Out-of-tree behavior file(s)
    #[arg(long = "behavior", value_name = "FILE", num_args = 1.., help_heading = "Keyboard")]
    pub behaviors: Vec<PathBuf>,

    /// Extension(s) of the artefacts to retrieve
    #[arg(short = 'f', value_name = "EXT", num_args = 1.., default_value = "uf2", help_heading = "Output")]
    pub extensions: Vec<String>,

    /// Directory to copy compiled artefacts into
    #[arg(long, value_name = "DIR", default_value_os_t = std::env::temp_dir(), help_heading = "Output")]
    pub into: PathBuf,

    /// Reusable build directory (defaults to a directory inside the container)
    #[arg(long, value_name = "DIR", help_heading = "Output")]
    pub build_dir: Option<PathBuf>,

    /// Build only the left side of a split shield
    #[arg(short, long, conflicts_with = "right_only", help_heading = "Output")]
    pub left_only: bool,

    /// Build only the right side of a split shield
    #[arg(short, long, help_heading = "Output")]
    pub right_only: bool,

    /// ZMK git repository (github-user[:branch]) or local ZMK source directory
    #[arg(long, value_name = "REPO", default_value = "zmkfirmware:main", help_heading = "ZMK")]
    pub zmk: String,

    /// Docker ZMK-build image
    #[arg(
        long,
        value_name = "IMAGE",
        default_value = "zmkfirmware/zmk-build-arm:3.2",
        help_heading = "ZMK"
    )]
    pub zmk_image: String,

    /// Clean build directories before starting
    #[arg(short, long)]
    pub pristine: bool,

    /// Print the plan without touching Docker
    #[arg(short = 'n', long)]
    pub dry_run: bool,

    /// Print more
    #[arg(short, long)]
    pub verbose: bool,

    /// Extra arguments passed to `west build`
    #[arg(last = true, value_name = "WEST_ARGS")]
    pub west_args: Vec<String>,
}

impl Args {
    /// A single positional argument is the board; only with two does the
    /// first become the shield.
    pub fn keyboard(&self) -> (Option<&str>, Option<&str>) {
        match (self.shield.as_deref(), self.board.as_deref()) {
            (shield, Some(board)) => (shield, Some(board)),
            (board, None) => (None, board),
        }
    }
}
