use anyhow::Context;
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use rustcta_pipeline::{
    core::config::{AppConfig, PaperSource},
    core::exchange::ExchangeGateway,
    cta::Orchestrator,
    exchanges::{BinancePublicFeed, MarketDataSource, PaperExchange, SyntheticMarket},
    utils::{
        logging::init_logging,
        trade_logger::{TradeFilter, TradeLogger},
        webhook::{run_alert_dispatcher, AlertBus, WebhookNotifier},
    },
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

#[derive(Parser)]
#[command(name = "rustcta-pipeline", version, about = "信号到执行的CTA交易流水线")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 启动流水线
    Run {
        #[arg(short, long, default_value = "config/pipeline.yaml")]
        config: String,
    },
    /// 只校验配置文件
    CheckConfig {
        #[arg(short, long, default_value = "config/pipeline.yaml")]
        config: String,
    },
    /// 统计交易记录
    Stats {
        #[arg(short, long, default_value = "trade_history")]
        dir: String,
        #[arg(long)]
        symbol: Option<String>,
        #[arg(long)]
        strategy: Option<String>,
        /// 起始日期 YYYYMMDD
        #[arg(long)]
        from: Option<String>,
        /// 结束日期 YYYYMMDD
        #[arg(long)]
        to: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 加载环境变量
    dotenv::dotenv().ok();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run { config } => run(&config).await,
        Commands::CheckConfig { config } => {
            let app = AppConfig::from_file(&config)
                .with_context(|| format!("配置文件 {} 校验失败", config))?;
            println!("✅ 配置有效: 模式 {:?}, 策略 {:?}", app.mode, app.signal.strategy);
            println!("{}", serde_yaml::to_string(&app)?);
            Ok(())
        }
        Commands::Stats {
            dir,
            symbol,
            strategy,
            from,
            to,
        } => {
            let filter = TradeFilter {
                from: parse_date(from.as_deref())?,
                to: parse_date(to.as_deref())?,
                symbol,
                strategy,
            };
            let stats = TradeLogger::new(&dir)?.statistics(&filter)?;
            println!("📊 交易统计 ({})", dir);
            println!("{}", serde_json::to_string_pretty(&stats)?);
            Ok(())
        }
    }
}

fn parse_date(value: Option<&str>) -> anyhow::Result<Option<NaiveDate>> {
    value
        .map(|s| NaiveDate::parse_from_str(s, "%Y%m%d").with_context(|| format!("日期格式错误: {}", s)))
        .transpose()
}

async fn run(config_path: &str) -> anyhow::Result<()> {
    // 配置错误在启动任何任务之前终止
    let config = AppConfig::from_file(config_path)
        .with_context(|| format!("加载配置 {} 失败", config_path))?;
    let _log_handle = init_logging(&config.logging)?;

    log::info!(
        "启动流水线: 配置 {}, 模式 {:?}, 行情来源 {:?}",
        config_path,
        config.mode,
        config.paper.source
    );

    let (stop_tx, stop_rx) = watch::channel(false);
    let source: Arc<dyn MarketDataSource> = match config.paper.source {
        PaperSource::Synthetic => {
            let market = Arc::new(SyntheticMarket::with_symbols(&config.paper.symbols));
            market.spawn_random_walk(
                config.feed.timeframe,
                Duration::from_millis(config.paper.tick_ms.max(1)),
                config.paper.seed,
                config.paper.start_price,
                stop_rx,
            );
            market
        }
        PaperSource::Binance => Arc::new(BinancePublicFeed::new(
            &config.paper.binance_rest_url,
            &config.paper.binance_ws_url,
            config.paper.default_max_leverage,
        )?),
    };
    let gateway: Arc<dyn ExchangeGateway> = Arc::new(PaperExchange::new(source));

    let (alerts, alert_rx) = AlertBus::channel();
    let dispatcher = tokio::spawn(run_alert_dispatcher(
        alert_rx,
        WebhookNotifier::new(config.alerts.clone()),
        config.strategy_tag.clone(),
    ));

    let (orchestrator, handle) = Orchestrator::new(config, gateway, alerts)?;

    let ctrl_c_handle = handle.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                log::info!("收到退出信号，正在停止...");
                ctrl_c_handle.shutdown();
            }
            Err(e) => log::error!("监听退出信号失败: {}", e),
        }
    });

    let result = orchestrator.run().await;
    let _ = stop_tx.send(true);
    drop(handle);
    // 编排器退出后告警通道关闭，分发任务随之结束
    if tokio::time::timeout(Duration::from_secs(5), dispatcher).await.is_err() {
        log::warn!("告警分发任务未能按时退出");
    }

    match result {
        Ok(()) => {
            log::info!("流水线已停止");
            Ok(())
        }
        Err(e) => {
            log::error!("流水线因致命错误停止: {}", e);
            Err(e.into())
        }
    }
}
