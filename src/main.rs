use colored::Colorize;

fn main() {
    match gitgov::run() {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("{} {}", "error:".red().bold(), e);
            if let Some(hint) = e.remediation() {
                eprintln!("{} {}", "hint:".yellow(), hint);
            }
            std::process::exit(1);
        }
    }
}
