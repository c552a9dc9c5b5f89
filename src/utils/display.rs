use crate::core::{Role, Turn};
use colored::*;

pub fn print_header(text: &str) {
    println!("\n{}", text.bright_cyan().bold());
    println!("{}", "=".repeat(text.len()).bright_cyan());
}

pub fn print_success(text: &str) {
    println!("{}", text.green());
}

pub fn print_error(text: &str) {
    eprintln!("{}", text.red().bold());
}

pub fn print_info(text: &str) {
    println!("{}", text.blue());
}

pub fn print_turn(turn: &Turn) {
    let label = format!("[{}] {}:", turn.timestamp.format("%Y-%m-%d %H:%M:%S"), turn.role);
    let label = match turn.role {
        Role::User => label.yellow().bold(),
        Role::Assistant => label.green().bold(),
        Role::System => label.magenta().bold(),
    };
    println!("{} {}", label, turn.content);

    if let Some(components) = &turn.components {
        println!("  {} {}", "components:".dimmed(), components);
    }
}
