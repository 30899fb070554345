//! Beacon allow-list filtering

use regex::{RegexSet, RegexSetBuilder};

use crate::config::BeaconConfig;
use crate::models::Advertisement;
use crate::platform::ScanRequest;

/// Accepts advertisements by service identifier or by device name prefix
#[derive(Debug, Clone)]
pub struct ScanFilter {
    service_uuids: Vec<String>,
    name_prefixes: RegexSet,
}

impl ScanFilter {
    pub fn new(service_uuids: &[String], name_prefixes: &[String]) -> Result<Self, regex::Error> {
        let patterns: Vec<String> = name_prefixes
            .iter()
            .filter(|p| !p.is_empty())
            .map(|p| format!("^{}", regex::escape(p)))
            .collect();
        let name_prefixes = RegexSetBuilder::new(patterns)
            .case_insensitive(true)
            .build()?;

        Ok(ScanFilter {
            service_uuids: service_uuids.iter().map(|u| u.to_lowercase()).collect(),
            name_prefixes,
        })
    }

    pub fn from_config(config: &BeaconConfig) -> Result<Self, regex::Error> {
        Self::new(&config.service_uuids, &config.name_prefixes)
    }

    pub fn matches(&self, adv: &Advertisement) -> bool {
        let by_service = adv
            .service_uuids
            .iter()
            .any(|uuid| self.service_uuids.iter().any(|allowed| allowed.eq_ignore_ascii_case(uuid)));
        by_service
            || adv
                .name
                .as_deref()
                .map(|name| self.name_prefixes.is_match(name))
                .unwrap_or(false)
    }

    /// Radio request for this filter
    ///
    /// Identifier filtering is only requested when the radio can honour it;
    /// otherwise a full scan is requested and `matches` does the work.
    pub fn scan_request(&self, native_filtering: bool) -> ScanRequest {
        if native_filtering && !self.service_uuids.is_empty() && self.name_prefixes.is_empty() {
            ScanRequest::filtered(self.service_uuids.clone())
        } else {
            ScanRequest::full()
        }
    }
}
