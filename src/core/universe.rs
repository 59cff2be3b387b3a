//! 交易对池管理
//! 定时刷新，整体替换；刷新失败沿用旧列表，连续失败达到上限升级为致命错误

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::core::config::UniverseConfig;
use crate::core::error::TradingError;
use crate::core::exchange::ExchangeGateway;
use crate::core::types::Instrument;
use crate::utils::webhook::{AlertBus, AlertEvent};

/// 交易对池快照，创建后不可变
#[derive(Debug, Clone, Default)]
pub struct Universe {
    instruments: BTreeMap<String, Instrument>,
    pub refreshed_at: Option<DateTime<Utc>>,
    pub generation: u64,
}

impl Universe {
    pub fn new(instruments: Vec<Instrument>, refreshed_at: DateTime<Utc>, generation: u64) -> Self {
        Self {
            instruments: instruments
                .into_iter()
                .map(|i| (i.symbol.clone(), i))
                .collect(),
            refreshed_at: Some(refreshed_at),
            generation,
        }
    }

    pub fn get(&self, symbol: &str) -> Option<&Instrument> {
        self.instruments.get(symbol)
    }

    pub fn contains(&self, symbol: &str) -> bool {
        self.instruments.contains_key(symbol)
    }

    pub fn symbols(&self) -> impl Iterator<Item = &String> {
        self.instruments.keys()
    }

    pub fn len(&self) -> usize {
        self.instruments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instruments.is_empty()
    }
}

/// 按配置过滤交易对
pub fn filter_instruments(config: &UniverseConfig, instruments: Vec<Instrument>) -> Vec<Instrument> {
    let whitelist: HashSet<&str> = config.whitelist.iter().map(String::as_str).collect();
    let blacklist: HashSet<&str> = config.blacklist.iter().map(String::as_str).collect();

    instruments
        .into_iter()
        .filter(|i| {
            if !i.tradable || i.quote_asset != config.quote_asset {
                return false;
            }
            if blacklist.contains(i.symbol.as_str()) {
                return false;
            }
            if !whitelist.is_empty() && !whitelist.contains(i.symbol.as_str()) {
                return false;
            }
            if i.liquidity < config.min_liquidity || i.quote_volume_24h < config.min_quote_volume {
                log::debug!("{} 流动性不足: {:?} {:.0}", i.symbol, i.liquidity, i.quote_volume_24h);
                return false;
            }
            if let Some(max_vol) = config.max_volatility_pct {
                if i.price_change_pct_24h > max_vol {
                    log::debug!("{} 24h波动 {:.2}% 超过上限", i.symbol, i.price_change_pct_24h);
                    return false;
                }
            }
            true
        })
        .collect()
}

/// 交易对池管理器
pub struct UniverseManager {
    config: UniverseConfig,
    gateway: Arc<dyn ExchangeGateway>,
    current: RwLock<Arc<Universe>>,
    consecutive_failures: AtomicU32,
    alerts: AlertBus,
}

impl UniverseManager {
    pub fn new(config: UniverseConfig, gateway: Arc<dyn ExchangeGateway>, alerts: AlertBus) -> Self {
        Self {
            config,
            gateway,
            current: RwLock::new(Arc::new(Universe::default())),
            consecutive_failures: AtomicU32::new(0),
            alerts,
        }
    }

    /// 当前快照；读者拿到的是一致的不可变版本
    pub async fn snapshot(&self) -> Arc<Universe> {
        self.current.read().await.clone()
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::SeqCst)
    }

    /// 刷新交易对池
    ///
    /// 失败时保留旧列表并返回 `UniverseFetch`；连续失败达到上限返回 `UniverseExhausted`。
    pub async fn refresh(&self) -> Result<Arc<Universe>, TradingError> {
        match self.fetch().await {
            Ok(instruments) => {
                let mut current = self.current.write().await;
                let universe = Arc::new(Universe::new(
                    instruments,
                    Utc::now(),
                    current.generation + 1,
                ));
                *current = universe.clone();
                self.consecutive_failures.store(0, Ordering::SeqCst);
                log::info!(
                    "🔄 交易对池刷新完成 (第{}版): {} 个交易对",
                    universe.generation,
                    universe.len()
                );
                Ok(universe)
            }
            Err(e) => {
                let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
                log::warn!(
                    "⚠️ 交易对池刷新失败 ({}/{})，继续使用旧列表: {}",
                    failures,
                    self.config.max_consecutive_failures,
                    e
                );
                self.alerts.emit(AlertEvent::UniverseRefreshFailed {
                    consecutive_failures: failures,
                    error: e.to_string(),
                });

                if failures >= self.config.max_consecutive_failures {
                    log::error!("🚨 交易对池连续刷新失败 {} 次", failures);
                    self.alerts.emit(AlertEvent::UniverseExhausted { failures });
                    return Err(TradingError::UniverseExhausted { failures });
                }
                Err(match e {
                    TradingError::UniverseFetch(_) => e,
                    other => TradingError::UniverseFetch(other.to_string()),
                })
            }
        }
    }

    async fn fetch(&self) -> Result<Vec<Instrument>, TradingError> {
        let raw = self.gateway.list_instruments().await?;
        if raw.is_empty() {
            return Err(TradingError::UniverseFetch("交易所返回空列表".to_string()));
        }
        let total = raw.len();
        let filtered = filter_instruments(&self.config, raw);
        log::debug!("交易对过滤: {} -> {}", total, filtered.len());
        Ok(filtered)
    }
}
