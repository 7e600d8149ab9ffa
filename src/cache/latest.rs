//! Latest-value store: one overwritten slot per key

use crate::cache::PduCache;
use crate::error::{Error, Result};
use crate::types::PduResolvedKey;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

/// Cache keeping only the most recent payload per key. Reads are
/// non-destructive.
#[derive(Default)]
pub struct LatestCache {
    running: AtomicBool,
    slots: Mutex<HashMap<PduResolvedKey, Vec<u8>>>,
}

impl LatestCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PduCache for LatestCache {
    fn open(&self, _config_path: &Path) -> Result<()> {
        // the latest store has no tunables
        Ok(())
    }

    fn close(&self) {
        self.slots.lock().clear();
        self.running.store(false, Ordering::SeqCst);
    }

    fn start(&self) {
        self.running.store(true, Ordering::SeqCst);
    }

    fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn write(&self, key: &PduResolvedKey, data: &[u8]) -> Result<()> {
        if !self.is_running() {
            return Err(Error::NotRunning);
        }
        self.slots.lock().insert(key.clone(), data.to_vec());
        Ok(())
    }

    fn read(&self, key: &PduResolvedKey, buf: &mut [u8]) -> Result<usize> {
        if !self.is_running() {
            return Err(Error::NotRunning);
        }
        let slots = self.slots.lock();
        let src = slots.get(key).ok_or(Error::NoEntry)?;
        if buf.len() < src.len() {
            return Err(Error::NoSpace {
                required: src.len(),
            });
        }
        buf[..src.len()].copy_from_slice(src);
        Ok(src.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> PduResolvedKey {
        PduResolvedKey::new("robot1", 1)
    }

    #[test]
    fn test_write_overwrites() {
        let cache = LatestCache::new();
        cache.start();
        cache.write(&key(), &[0xAA]).unwrap();
        cache.write(&key(), &[0xBB, 0xCC]).unwrap();

        let mut buf = [0u8; 8];
        let n = cache.read(&key(), &mut buf).unwrap();
        assert_eq!(&buf[..n], &[0xBB, 0xCC]);
    }

    #[test]
    fn test_read_is_non_destructive() {
        let cache = LatestCache::new();
        cache.start();
        cache.write(&key(), &[1, 2, 3]).unwrap();

        let mut buf = [0u8; 8];
        assert_eq!(cache.read(&key(), &mut buf).unwrap(), 3);
        assert_eq!(cache.read(&key(), &mut buf).unwrap(), 3);
    }

    #[test]
    fn test_read_missing_entry() {
        let cache = LatestCache::new();
        cache.start();
        let mut buf = [0u8; 8];
        assert!(matches!(
            cache.read(&key(), &mut buf),
            Err(Error::NoEntry)
        ));
    }

    #[test]
    fn test_small_buffer_reports_required_size() {
        let cache = LatestCache::new();
        cache.start();
        cache.write(&key(), &[1, 2, 3, 4]).unwrap();
        let mut buf = [0u8; 2];
        assert!(matches!(
            cache.read(&key(), &mut buf),
            Err(Error::NoSpace { required: 4 })
        ));
    }

    #[test]
    fn test_requires_start() {
        let cache = LatestCache::new();
        assert!(matches!(
            cache.write(&key(), &[1]),
            Err(Error::NotRunning)
        ));
        cache.start();
        cache.write(&key(), &[1]).unwrap();
        cache.stop();
        let mut buf = [0u8; 1];
        assert!(matches!(
            cache.read(&key(), &mut buf),
            Err(Error::NotRunning)
        ));
    }
}
