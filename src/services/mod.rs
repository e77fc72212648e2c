//! Business services. Each service owns a database handle and the cache;
//! event side effects go through the transactional outbox rather than a
//! direct broker publish.

pub mod analytics;
pub mod clients;
pub mod invoices;
pub mod payments;

pub use analytics::AnalyticsService;
pub use clients::ClientService;
pub use invoices::InvoiceService;
pub use payments::PaymentService;

/// Pagination bounds for list endpoints, sourced from configuration.
#[derive(Debug, Clone, Copy)]
pub struct PageLimits {
    pub default_page_size: u64,
    pub max_page_size: u64,
}

impl Default for PageLimits {
    fn default() -> Self {
        Self {
            default_page_size: 20,
            max_page_size: 100,
        }
    }
}

impl PageLimits {
    /// Normalize a requested page size: zero falls back to the default,
    /// anything above the cap is clamped down to it.
    pub fn clamp(&self, per_page: u64) -> u64 {
        if per_page == 0 {
            self.default_page_size
        } else {
            per_page.min(self.max_page_size)
        }
    }
}

impl From<&crate::config::AppConfig> for PageLimits {
    fn from(cfg: &crate::config::AppConfig) -> Self {
        Self {
            default_page_size: cfg.default_page_size,
            max_page_size: cfg.max_page_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::PageLimits;

    #[test]
    fn page_size_is_defaulted_and_capped() {
        let limits = PageLimits::default();
        assert_eq!(limits.clamp(0), 20);
        assert_eq!(limits.clamp(50), 50);
        assert_eq!(limits.clamp(500), 100);
    }
}
