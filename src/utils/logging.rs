use crate::core::config::LoggingConfig;
use crate::core::error::TradingError;
use log::LevelFilter;
use log4rs::append::console::ConsoleAppender;
use log4rs::append::file::FileAppender;
use log4rs::config::{Appender, Config, Logger, Root};
use log4rs::encode::pattern::PatternEncoder;
/// 统一日志初始化
/// 控制台 + 文件双输出，格式和级别来自配置
use std::path::PathBuf;

pub fn parse_level(level: &str) -> LevelFilter {
    match level.to_uppercase().as_str() {
        "TRACE" => LevelFilter::Trace,
        "DEBUG" => LevelFilter::Debug,
        "INFO" => LevelFilter::Info,
        "WARN" | "WARNING" => LevelFilter::Warn,
        "ERROR" => LevelFilter::Error,
        "OFF" => LevelFilter::Off,
        _ => LevelFilter::Info,
    }
}

/// 构建 log4rs 配置
pub fn build_config(config: &LoggingConfig) -> Result<Config, TradingError> {
    let log_path: PathBuf = [config.root_dir.as_str(), config.file_name.as_str()]
        .iter()
        .collect();

    let file = FileAppender::builder()
        .encoder(Box::new(PatternEncoder::new(&config.pattern)))
        .build(&log_path)?;

    let mut builder =
        Config::builder().appender(Appender::builder().build("file", Box::new(file)));
    let mut root = Root::builder().appender("file");

    if config.console_output {
        let console = ConsoleAppender::builder()
            .encoder(Box::new(PatternEncoder::new(&config.pattern)))
            .build();
        builder = builder.appender(Appender::builder().build("console", Box::new(console)));
        root = root.appender("console");
    }

    // 第三方库的连接日志太多
    builder = builder
        .logger(Logger::builder().build("tungstenite", LevelFilter::Warn))
        .logger(Logger::builder().build("tokio_tungstenite", LevelFilter::Warn))
        .logger(Logger::builder().build("reqwest", LevelFilter::Warn));

    builder
        .build(root.build(parse_level(&config.level)))
        .map_err(|e| TradingError::FatalConfiguration(format!("日志配置错误: {}", e)))
}

/// 初始化全局日志，只能调用一次
pub fn init_logging(config: &LoggingConfig) -> Result<log4rs::Handle, TradingError> {
    std::fs::create_dir_all(&config.root_dir)?;
    let log_config = build_config(config)?;
    log4rs::init_config(log_config)
        .map_err(|e| TradingError::FatalConfiguration(format!("日志初始化失败: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("debug"), LevelFilter::Debug);
        assert_eq!(parse_level("warning"), LevelFilter::Warn);
        assert_eq!(parse_level("bogus"), LevelFilter::Info);
    }

    #[test]
    fn test_build_config_creates_file_appender() {
        let dir = tempfile::tempdir().unwrap();
        let config = LoggingConfig {
            root_dir: dir.path().to_string_lossy().to_string(),
            console_output: false,
            ..LoggingConfig::default()
        };
        let built = build_config(&config).unwrap();
        assert_eq!(built.appenders().len(), 1);
        assert_eq!(built.root().level(), LevelFilter::Info);
        assert!(dir.path().join("pipeline.log").exists());
    }
}
