use console::{Emoji, style};

pub static SUCCESS_ICON: Emoji<'_, '_> = Emoji("✅ ", "");
pub static INFO_ICON: Emoji<'_, '_> = Emoji("ℹ️  ", "");
pub static WARN_ICON: Emoji<'_, '_> = Emoji("⚠️  ", "");
pub static ERROR_ICON: Emoji<'_, '_> = Emoji("❌ ", "");
pub static HOURGLASS: Emoji<'_, '_> = Emoji("⏳ ", "");
pub static SPARKLE: Emoji<'_, '_> = Emoji("✨ ", "");

pub fn print_success(msg: &str) {
    println!("{} {}", SUCCESS_ICON, style(msg).green());
}

pub fn print_info(msg: &str) {
    println!("{} {}", INFO_ICON, style(msg).blue());
}

pub fn print_warn(msg: &str) {
    println!("{} {}", WARN_ICON, style(msg).yellow());
}

pub fn print_error(msg: &str) {
    eprintln!("{} {}", ERROR_ICON, style(msg).red().bold());
}

pub fn print_waiting(msg: &str) {
    println!("{} {}", HOURGLASS, style(msg).yellow());
}

/// Colour a run, task, step or approval status for display.
pub fn styled_status(status: &str) -> String {
    match status {
        "completed" | "approved" | "success" => style(status).green().bold().to_string(),
        "failed" | "rejected" | "terminated" => style(status).red().bold().to_string(),
        "waiting_approval" | "approval_needed" | "pending" => style(status).yellow().bold().to_string(),
        "skipped" | "expired" => style(status).dim().to_string(),
        _ => style(status).cyan().to_string(),
    }
}

/// A titled block of help lines, key/value rows and notes.
pub struct GuideSection {
    title: String,
    lines: Vec<String>,
}

impl GuideSection {
    pub fn new(title: &str) -> Self {
        Self {
            title: title.to_string(),
            lines: Vec::new(),
        }
    }

    pub fn command(mut self, name: &str, description: &str) -> Self {
        self.lines.push(format!(
            "  {} {}",
            style(format!("{:<34}", name)).cyan().bold(),
            style(description).dim()
        ));
        self
    }

    pub fn status(mut self, label: &str, value: &str) -> Self {
        self.lines
            .push(format!("  {} {}", style(format!("{}:", label)).bold(), value));
        self
    }

    pub fn text(mut self, text: &str) -> Self {
        for line in text.lines() {
            self.lines.push(format!("  {}", line));
        }
        self
    }

    pub fn info(mut self, msg: &str) -> Self {
        self.lines.push(format!("  {} {}", INFO_ICON, style(msg).blue()));
        self
    }

    pub fn warn(mut self, msg: &str) -> Self {
        self.lines.push(format!("  {} {}", WARN_ICON, style(msg).yellow()));
        self
    }

    pub fn blank(mut self) -> Self {
        self.lines.push(String::new());
        self
    }

    pub fn print(&self) {
        println!();
        println!("{}", style(&self.title).bold().underlined());
        for line in &self.lines {
            println!("{}", line);
        }
    }
}

pub fn print_banner() {
    let lines: &[&str] = &[
        r"              _ _       _                       _ ",
        r" _____      _(_) |_ ___| |__  _   _  __ _ _ __ __| |",
        r"/ __\ \ /\ / / | __/ __| '_ \| | | |/ _` | '__/ _` |",
        r"\__ \\ V  V /| | || (__| | | | |_| | (_| | | | (_| |",
        r"|___/ \_/\_/ |_|\__\___|_| |_|\__, |\__,_|_|  \__,_|",
        r"                              |___/                 ",
    ];

    // Diagonal gradient from amber to teal.
    let stops: [(u8, u8, u8); 3] = [(251, 191, 36), (249, 115, 22), (20, 184, 166)];
    let max_w = 52u32;
    let max_d = max_w + 5 * 10;

    println!();
    for (y, line) in lines.iter().enumerate() {
        for (x, ch) in line.chars().enumerate() {
            if ch == ' ' {
                print!(" ");
                continue;
            }
            let d = ((x as u32 + y as u32 * 10) * 1000 / max_d).min(1000);
            let (r, g, b) = if d <= 500 {
                lerp_color(stops[0], stops[1], d * 2)
            } else {
                lerp_color(stops[1], stops[2], (d - 500) * 2)
            };
            print!("\x1b[38;2;{};{};{}m{}", r, g, b, ch);
        }
        println!();
    }
    print!("\x1b[0m");
    println!("\x1b[38;2;20;184;166mRoute every step, gate every risk.\x1b[0m\n");
}

fn lerp_color(a: (u8, u8, u8), b: (u8, u8, u8), t: u32) -> (u8, u8, u8) {
    let r = (a.0 as u32 * (1000 - t) + b.0 as u32 * t) / 1000;
    let g = (a.1 as u32 * (1000 - t) + b.1 as u32 * t) / 1000;
    let b_val = (a.2 as u32 * (1000 - t) + b.2 as u32 * t) / 1000;
    (r as u8, g as u8, b_val as u8)
}

pub fn print_goodbye() {
    println!("\n{} {}", SPARKLE, style("switchyard signing off.").bold().cyan());
}
