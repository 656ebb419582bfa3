use std::path::PathBuf;

use crate::error::{TuskError, TuskResult};

/// Configuration for a buffer manager instance.
#[derive(Clone, Debug)]
pub struct BufferConfig {
    /// Size in bytes of every page. Must be at least 8 and a multiple of 8
    /// so page buffers align to 8-byte boundaries. Default: 4 KiB.
    pub page_size: usize,
    /// Maximum number of pages resident in memory at the same time.
    /// Must be at least 1. Default: 64.
    pub page_count: usize,
    /// Directory holding the segment files, which are named by the decimal
    /// rendering of the segment id. Default: the current directory.
    pub directory: PathBuf,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            page_size: 4096,
            page_count: 64,
            directory: PathBuf::from("."),
        }
    }
}

impl BufferConfig {
    /// Check the numeric constraints. Violations are programming errors
    /// and surface as `InvalidArgument`.
    pub fn validate(&self) -> TuskResult<()> {
        if self.page_count == 0 {
            return Err(TuskError::InvalidArgument(
                "page_count must be at least 1".into(),
            ));
        }
        if self.page_size < 8 || self.page_size % 8 != 0 {
            return Err(TuskError::InvalidArgument(format!(
                "page_size must be >= 8 and a multiple of 8, got {}",
                self.page_size
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_values() {
        let config = BufferConfig::default();
        assert_eq!(config.page_size, 4096);
        assert_eq!(config.page_count, 64);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_zero_page_count() {
        let config = BufferConfig {
            page_count: 0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(TuskError::InvalidArgument(_))
        ));
    }

    #[test]
    fn rejects_bad_page_size() {
        for page_size in [0, 4, 7, 12, 100] {
            let config = BufferConfig {
                page_size,
                ..Default::default()
            };
            assert!(config.validate().is_err(), "page_size {page_size}");
        }
    }

    #[test]
    fn accepts_small_aligned_page_size() {
        let config = BufferConfig {
            page_size: 64,
            page_count: 10,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }
}
