use std::io::Write;

use env_logger::{Builder, Env, Target};
use log::LevelFilter;

fn level_for(verbosity: u8) -> LevelFilter {
    match verbosity {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        _ => LevelFilter::Debug,
    }
}

/// Logs to stderr with local timestamps. `RUST_LOG` wins over `verbosity`.
pub fn init_logger(verbosity: u8) {
    let default = level_for(verbosity).to_string().to_lowercase();
    let _ = Builder::from_env(Env::default().default_filter_or(default))
        .format(|buf, record| {
            writeln!(
                buf,
                "{} [{:<5}] {} - {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .target(Target::Stderr)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_raises_the_level() {
        assert_eq!(level_for(0), LevelFilter::Warn);
        assert_eq!(level_for(1), LevelFilter::Info);
        assert_eq!(level_for(4), LevelFilter::Debug);
    }
}
