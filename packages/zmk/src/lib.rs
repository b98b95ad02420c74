// ABOUTME: ZMK-specific collaborators of the sandbox core
// ABOUTME: Board/shield discovery heuristics and west build-plan generation

pub mod keyboard;
pub mod plan;

pub use keyboard::{
    guess_board_name, guess_board_type, guess_shield_name, split_shield_sides, KeyboardError,
    ZmkSource,
};
pub use plan::{
    build_script, compilation_items, west_build_command, BuildScriptArgs, CompilationItem,
    SideFilter, WestBuildArgs,
};
