use std::collections::HashMap;
use std::sync::RwLock;
use uuid::Uuid;

use crate::types::Candle;

/// Keyed sliding window of the most recent candles per workload. The data
/// loop is the only writer for a given key; the action loop reads snapshots.
/// Writes are atomic per `save_candles` call.
pub struct CandleStore {
    windows: RwLock<HashMap<Uuid, Vec<Candle>>>,
    window_size: usize,
}

impl CandleStore {
    pub fn new(window_size: usize) -> Self {
        Self {
            windows: RwLock::new(HashMap::new()),
            window_size,
        }
    }

    /// Inserts candles in argument order. A candle equal to the window's last
    /// one (same open/close time) overwrites its mutable fields; otherwise it
    /// is appended and the oldest entries are evicted past the window size.
    pub fn save_candles(&self, key: Uuid, candles: impl IntoIterator<Item = Candle>) {
        let mut windows = self.windows.write().expect("candle store lock poisoned");
        let window = windows.entry(key).or_default();

        for candle in candles {
            match window.last_mut() {
                Some(last) if last.is_same_bar(&candle) => {
                    last.open = candle.open;
                    last.close = candle.close;
                    last.high = candle.high;
                    last.low = candle.low;
                    last.volume = candle.volume;
                    last.trade_count = candle.trade_count;
                }
                _ => {
                    window.push(candle);

                    if window.len() > self.window_size {
                        let excess = window.len() - self.window_size;
                        window.drain(..excess);
                    }
                }
            }
        }
    }

    /// Returns a snapshot copy of the window; mutations to it do not affect
    /// the store.
    pub fn candles(&self, key: Uuid) -> Vec<Candle> {
        self.windows
            .read()
            .expect("candle store lock poisoned")
            .get(&key)
            .cloned()
            .unwrap_or_default()
    }

    pub fn delete_candles(&self, key: Uuid) {
        self.windows
            .write()
            .expect("candle store lock poisoned")
            .remove(&key);
    }
}
