use std::path::PathBuf;

use clap::Parser;

// ============================================================================
// Output Format Options
// ============================================================================

#[derive(Debug, Clone, Copy)]
pub enum OutputFormat {
    Tree,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "tree" | "ascii" => Ok(OutputFormat::Tree),
            "json" => Ok(OutputFormat::Json),
            other => Err(format!("Unknown format: {}", other)),
        }
    }
}

/// mirafs - inspect and maintain the local mirror of a remote drive
///
/// Operates on the snapshot and content cache left behind by a mounted
/// session: prints the mirrored tree, audits its structural invariants and
/// evicts cached content down to a size budget. Never touches the network.
#[derive(Parser, Debug)]
#[command(name = "mirafs")]
#[command(about = "Offline inspector for the mirrored directory tree and file cache")]
#[command(args_override_self = true)]
pub struct Args {
    // ========================================================================
    // Cache Location Options
    // ========================================================================
    /// Override cache directory location
    #[arg(long)]
    pub cache_dir: Option<String>,

    /// Account subdirectory below the cache root
    #[arg(short, long, default_value = "default")]
    pub account: String,

    /// Options file whose lines are prepended to the argument list
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    // ========================================================================
    // Output & Display Options
    // ========================================================================
    /// Suppress tree output (useful with --check or --evict)
    #[arg(short, long)]
    pub quiet: bool,

    /// Output format: tree or json
    #[arg(long, default_value = "tree")]
    pub format: OutputFormat,

    /// Maximum depth to display
    #[arg(short, long)]
    pub max_depth: Option<usize>,

    // ========================================================================
    // Maintenance Options
    // ========================================================================
    /// Verify tree invariants and audit the content cache
    #[arg(long)]
    pub check: bool,

    /// Evict cached content down to the size budget
    #[arg(long)]
    pub evict: bool,

    /// Content cache size budget in bytes (default: 1 GiB)
    #[arg(long, default_value_t = 1_073_741_824)]
    pub budget: u64,

    /// Display summary statistics (entry counts, cache usage, timing)
    #[arg(long)]
    pub stats: bool,
}

/// Parse arguments, merging in the options file if one is given or found.
///
/// The options file holds one option per line (blank lines and `#` comments
/// ignored); its tokens are inserted after the program name so that options
/// on the real command line win.
pub fn parse_args() -> Args {
    let argv: Vec<String> = std::env::args().collect();
    let first = Args::parse_from(&argv);

    let config_path = first.config.clone().or_else(default_config_path);
    let Some(path) = config_path else {
        return first;
    };

    match read_options_file(&path) {
        Some(extra) if !extra.is_empty() => {
            log::debug!("merged {} options from {}", extra.len(), path.display());
            let mut merged = Vec::with_capacity(argv.len() + extra.len());
            merged.push(argv[0].clone());
            merged.extend(extra);
            merged.extend(argv[1..].iter().cloned());
            Args::parse_from(merged)
        }
        _ => first,
    }
}

/// Default options file: $XDG_CONFIG_HOME/mirafs/config or ~/.config/mirafs/config.
fn default_config_path() -> Option<PathBuf> {
    if let Ok(dir) = std::env::var("XDG_CONFIG_HOME") {
        let path = PathBuf::from(dir);
        if path.is_absolute() {
            return Some(path.join("mirafs").join("config"));
        }
    }
    let home = std::env::var("HOME").ok()?;
    Some(PathBuf::from(home).join(".config").join("mirafs").join("config"))
}

fn read_options_file(path: &std::path::Path) -> Option<Vec<String>> {
    let content = std::fs::read_to_string(path).ok()?;
    Some(parse_options(&content))
}

fn parse_options(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .flat_map(|line| line.split_whitespace().map(str::to_string))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_options_skips_comments_and_blanks() {
        let content = "# budget for the laptop\n--budget 1000000\n\n--quiet\n";
        assert_eq!(
            parse_options(content),
            vec!["--budget", "1000000", "--quiet"]
        );
    }

    #[test]
    fn test_command_line_wins_over_options_file() {
        let merged = vec![
            "mirafs".to_string(),
            "--budget".to_string(),
            "1000".to_string(),
            "--budget".to_string(),
            "2000".to_string(),
        ];
        let args = Args::parse_from(merged);
        // clap keeps the last occurrence, which is the real command line
        assert_eq!(args.budget, 2000);
    }
}
