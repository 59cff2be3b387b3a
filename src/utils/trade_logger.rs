use crate::core::error::TradingError;
use crate::core::types::{ExitReason, PositionSide};
use chrono::{DateTime, NaiveDate, Utc};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
/// 交易记录
/// 每个UTC日一个 JSON lines 文件: trades_YYYYMMDD.jsonl
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// 一笔已平仓交易
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub trade_id: String,
    pub symbol: String,
    pub side: PositionSide,
    pub quantity: f64,
    pub entry_price: f64,
    pub exit_price: f64,
    pub leverage: u32,
    pub realized_pnl: f64,
    pub strategy: String,
    pub stop_loss: f64,
    pub take_profit: Option<f64>,
    pub exit_reason: ExitReason,
    pub opened_at: DateTime<Utc>,
    pub closed_at: DateTime<Utc>,
}

impl TradeRecord {
    pub fn position_value(&self) -> f64 {
        self.quantity * self.entry_price
    }
}

/// 统计过滤条件
#[derive(Debug, Clone, Default)]
pub struct TradeFilter {
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
    pub symbol: Option<String>,
    pub strategy: Option<String>,
}

impl TradeFilter {
    fn matches_date(&self, date: NaiveDate) -> bool {
        self.from.map_or(true, |from| date >= from) && self.to.map_or(true, |to| date <= to)
    }

    fn matches(&self, record: &TradeRecord) -> bool {
        self.symbol.as_ref().map_or(true, |s| &record.symbol == s)
            && self
                .strategy
                .as_ref()
                .map_or(true, |s| &record.strategy == s)
            && self.matches_date(record.closed_at.date_naive())
    }
}

/// 交易统计
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TradeStatistics {
    pub total_trades: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,
    pub win_rate: f64,
    pub total_profit: f64,
    pub total_loss: f64,
    pub net_pnl: f64,
    pub max_profit: f64,
    pub max_loss: f64,
    pub avg_profit: f64,
    pub avg_loss: f64,
}

impl TradeStatistics {
    pub fn from_records(records: &[TradeRecord]) -> Self {
        let mut stats = TradeStatistics {
            total_trades: records.len(),
            ..Default::default()
        };

        for record in records {
            let pnl = record.realized_pnl;
            if pnl > 0.0 {
                stats.winning_trades += 1;
                stats.total_profit += pnl;
                stats.max_profit = stats.max_profit.max(pnl);
            } else if pnl < 0.0 {
                stats.losing_trades += 1;
                stats.total_loss += pnl;
                stats.max_loss = stats.max_loss.min(pnl);
            }
        }

        stats.net_pnl = stats.total_profit + stats.total_loss;
        if stats.total_trades > 0 {
            stats.win_rate = stats.winning_trades as f64 / stats.total_trades as f64 * 100.0;
        }
        if stats.winning_trades > 0 {
            stats.avg_profit = stats.total_profit / stats.winning_trades as f64;
        }
        if stats.losing_trades > 0 {
            stats.avg_loss = stats.total_loss / stats.losing_trades as f64;
        }
        stats
    }
}

/// 交易记录器
pub struct TradeLogger {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl TradeLogger {
    pub fn new(dir: impl AsRef<Path>) -> Result<Self, TradingError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        info!("📒 交易记录目录: {}", dir.display());
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn file_for(&self, date: NaiveDate) -> PathBuf {
        self.dir.join(format!("trades_{}.jsonl", date.format("%Y%m%d")))
    }

    /// 追加一条记录，按平仓日期落到对应文件
    pub fn append(&self, record: &TradeRecord) -> Result<(), TradingError> {
        let line = serde_json::to_string(record)?;
        let path = self.file_for(record.closed_at.date_naive());

        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| TradingError::Io(std::io::Error::other("交易记录写锁中毒")))?;
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        writeln!(file, "{}", line)?;
        Ok(())
    }

    /// 读取满足条件的记录，损坏的行跳过
    pub fn load(&self, filter: &TradeFilter) -> Result<Vec<TradeRecord>, TradingError> {
        let mut files: Vec<(NaiveDate, PathBuf)> = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let date = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_prefix("trades_"))
                .and_then(|n| n.strip_suffix(".jsonl"))
                .and_then(|d| NaiveDate::parse_from_str(d, "%Y%m%d").ok());
            if let Some(date) = date {
                if filter.matches_date(date) {
                    files.push((date, path));
                }
            }
        }
        files.sort();

        let mut records = Vec::new();
        for (_, path) in files {
            let reader = BufReader::new(fs::File::open(&path)?);
            for (line_no, line) in reader.lines().enumerate() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<TradeRecord>(&line) {
                    Ok(record) if filter.matches(&record) => records.push(record),
                    Ok(_) => {}
                    Err(e) => warn!("跳过损坏的记录 {}:{}: {}", path.display(), line_no + 1, e),
                }
            }
        }
        Ok(records)
    }

    pub fn statistics(&self, filter: &TradeFilter) -> Result<TradeStatistics, TradingError> {
        Ok(TradeStatistics::from_records(&self.load(filter)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn record(symbol: &str, pnl: f64, day: u32) -> TradeRecord {
        let closed_at = Utc.with_ymd_and_hms(2024, 5, day, 12, 0, 0).unwrap();
        TradeRecord {
            trade_id: format!("{}-{}", symbol, day),
            symbol: symbol.to_string(),
            side: PositionSide::Long,
            quantity: 1.0,
            entry_price: 100.0,
            exit_price: 100.0 + pnl,
            leverage: 5,
            realized_pnl: pnl,
            strategy: "rule_table".to_string(),
            stop_loss: 98.0,
            take_profit: Some(103.0),
            exit_reason: ExitReason::Signal,
            opened_at: closed_at - chrono::Duration::hours(1),
            closed_at,
        }
    }

    #[test]
    fn test_daily_files_and_statistics() {
        let dir = tempfile::tempdir().unwrap();
        let logger = TradeLogger::new(dir.path()).unwrap();

        logger.append(&record("BTCUSDT", 10.0, 1)).unwrap();
        logger.append(&record("BTCUSDT", -4.0, 1)).unwrap();
        logger.append(&record("ETHUSDT", 6.0, 2)).unwrap();

        assert!(dir.path().join("trades_20240501.jsonl").exists());
        assert!(dir.path().join("trades_20240502.jsonl").exists());

        let stats = logger.statistics(&TradeFilter::default()).unwrap();
        assert_eq!(stats.total_trades, 3);
        assert_eq!(stats.winning_trades, 2);
        assert_eq!(stats.losing_trades, 1);
        assert_eq!(stats.net_pnl, 12.0);
        assert_eq!(stats.max_profit, 10.0);
        assert_eq!(stats.max_loss, -4.0);
        assert_eq!(stats.avg_profit, 8.0);
    }

    #[test]
    fn test_filters_and_corrupt_lines() {
        let dir = tempfile::tempdir().unwrap();
        let logger = TradeLogger::new(dir.path()).unwrap();
        logger.append(&record("BTCUSDT", 10.0, 1)).unwrap();
        logger.append(&record("ETHUSDT", -2.0, 3)).unwrap();

        let path = dir.path().join("trades_20240501.jsonl");
        let mut file = OpenOptions::new().append(true).open(path).unwrap();
        writeln!(file, "{{not json").unwrap();

        let filter = TradeFilter {
            symbol: Some("ETHUSDT".into()),
            ..Default::default()
        };
        assert_eq!(logger.load(&filter).unwrap().len(), 1);

        let filter = TradeFilter {
            to: NaiveDate::from_ymd_opt(2024, 5, 2),
            ..Default::default()
        };
        let records = logger.load(&filter).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].symbol, "BTCUSDT");
    }
}
