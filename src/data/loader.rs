use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use log::{debug, info, warn, error};

use crate::config::DEFAULT_TICK_INTERVAL_MS;
use crate::data::producer::{DataProducer, PriceEvent, PRODUCER_CHANNEL_SIZE};

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid record at line {line}: {reason}")]
    InvalidRecord { line: usize, reason: String },
    #[error("no valid prices in {path} ({errors} bad lines)")]
    Empty { path: PathBuf, errors: usize },
}

/// Parses one CSV record into a price.
///
/// Accepts either a bare `price` or a `date,open,high,low,close,volume` row,
/// in which case the close is used.
pub fn parse_price_line(line: &str, line_num: usize) -> Result<f64, LoadError> {
    let fields: Vec<&str> = line.split(',').map(str::trim).collect();

    let raw = match fields.len() {
        1 => fields[0],
        6 => fields[4],
        n => {
            return Err(LoadError::InvalidRecord {
                line: line_num + 1,
                reason: format!("expected 1 or 6 fields, got {}", n),
            })
        }
    };

    let price: f64 = raw.parse().map_err(|e| LoadError::InvalidRecord {
        line: line_num + 1,
        reason: format!("invalid price {:?}: {}", raw, e),
    })?;

    if !price.is_finite() {
        return Err(LoadError::InvalidRecord {
            line: line_num + 1,
            reason: format!("price is not finite: {}", raw),
        });
    }

    Ok(price)
}

pub struct DataLoader;

impl DataLoader {
    pub fn load_prices(file_path: &Path) -> Result<Vec<f64>, LoadError> {
        let file = File::open(file_path).map_err(|source| LoadError::Io {
            path: file_path.to_path_buf(),
            source,
        })?;

        let reader = BufReader::new(file);
        let mut prices = Vec::new();
        let mut errors = 0;

        for (line_num, line_result) in reader.lines().enumerate() {
            let line = line_result.map_err(|source| LoadError::Io {
                path: file_path.to_path_buf(),
                source,
            })?;
            let trimmed = line.trim();

            if trimmed.is_empty() || trimmed.starts_with('#') || is_header(trimmed) {
                continue;
            }

            match parse_price_line(trimmed, line_num) {
                Ok(price) => prices.push(price),
                Err(e) => {
                    error!("{}: {}", file_path.display(), e);
                    errors += 1;
                }
            }
        }

        if prices.is_empty() {
            return Err(LoadError::Empty {
                path: file_path.to_path_buf(),
                errors,
            });
        }

        if errors > 0 {
            warn!("Loaded {} prices from {} with {} errors", prices.len(), file_path.display(), errors);
        } else {
            info!("Loaded {} prices from {}", prices.len(), file_path.display());
        }

        Ok(prices)
    }

    /// Builds one replay provider per `*.csv` file in `data_dir`, named after
    /// the file stem. Files that fail to load are skipped.
    pub fn load_replay_dir(data_dir: &Path, interval: Duration) -> Result<Vec<ReplayProvider>, LoadError> {
        let entries = std::fs::read_dir(data_dir).map_err(|source| LoadError::Io {
            path: data_dir.to_path_buf(),
            source,
        })?;

        let mut paths: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.extension() == Some(std::ffi::OsStr::new("csv")))
            .collect();
        paths.sort();

        let mut providers = Vec::new();
        for path in paths {
            let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };

            match Self::load_prices(&path) {
                Ok(prices) => {
                    providers.push(ReplayProvider::new(name, prices).with_interval(interval));
                }
                Err(e) => {
                    error!("Skipping replay source {}: {}", name, e);
                }
            }
        }

        info!("Loaded {} replay sources from {}", providers.len(), data_dir.display());
        Ok(providers)
    }
}

fn is_header(line: &str) -> bool {
    line.split(',')
        .next()
        .map(|first| first.trim().eq_ignore_ascii_case("date") || first.trim().eq_ignore_ascii_case("price"))
        .unwrap_or(false)
}

/// Replays a fixed list of prices in order, wrapping around forever. An
/// empty list yields a sequence that is already finished.
#[derive(Debug, Clone)]
pub struct ReplayProvider {
    name: String,
    prices: Arc<Vec<f64>>,
    interval: Duration,
}

impl ReplayProvider {
    pub fn new(name: impl Into<String>, prices: Vec<f64>) -> Self {
        let name = name.into();
        debug_assert!(!name.is_empty(), "replay source name must not be empty");
        Self {
            name,
            prices: Arc::new(prices),
            interval: Duration::from_millis(DEFAULT_TICK_INTERVAL_MS),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn len(&self) -> usize {
        self.prices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prices.is_empty()
    }
}

impl DataProducer for ReplayProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn produce(&self) -> mpsc::Receiver<PriceEvent> {
        let (tx, rx) = mpsc::channel(PRODUCER_CHANNEL_SIZE);
        let name = self.name.clone();
        let prices = self.prices.clone();
        let interval = self.interval;

        tokio::spawn(async move {
            // An empty list ends the sequence at once; the sender drops here.
            if prices.is_empty() {
                warn!("Replay source {} has no prices, nothing to emit", name);
                return;
            }

            info!("Starting replay of {} ({} prices)", name, prices.len());

            for &price in prices.iter().cycle() {
                tokio::time::sleep(interval).await;

                if tx.send(PriceEvent::new(name.clone(), price)).await.is_err() {
                    debug!("Consumer for replay {} went away, stopping", name);
                    break;
                }
            }
        });

        rx
    }
}
