use std::sync::{Arc, Mutex};

use veilchain_core::LedgerError;
use veilchain_storage::BlockDao;

const PAGE: usize = 512;

/// Cached list of encrypted block numbers, ascending. Deep content search
/// walks this instead of re-scanning the chain; append and checkpoint
/// restore invalidate it.
#[derive(Default)]
pub struct EncryptedBlocksCache {
    inner: Mutex<Option<Arc<Vec<u64>>>>,
}

impl EncryptedBlocksCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, dao: &dyn BlockDao) -> Result<Arc<Vec<u64>>, LedgerError> {
        {
            let cached = self.inner.lock().expect("cache poisoned");
            if let Some(list) = cached.as_ref() {
                return Ok(list.clone());
            }
        }

        let mut numbers = Vec::new();
        let mut offset = 0u64;
        loop {
            let page = dao.get_encrypted_blocks_paginated(offset, PAGE)?;
            if page.is_empty() {
                break;
            }
            offset += page.len() as u64;
            numbers.extend(page.into_iter().map(|b| b.block_number));
        }
        let list = Arc::new(numbers);

        let mut cached = self.inner.lock().expect("cache poisoned");
        *cached = Some(list.clone());
        Ok(list)
    }

    pub fn invalidate(&self) {
        *self.inner.lock().expect("cache poisoned") = None;
    }
}
