mod display;

pub use display::{print_error, print_header, print_info, print_success, print_turn};
