use log::{info, warn};

/// Thin wrapper over the `log` facade that prefixes every message with a scope.
#[derive(Debug, Clone, Default)]
pub struct LogManager {
    scope: String,
}

impl LogManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scoped(scope: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
        }
    }

    /// Narrows the scope to one tomogram.
    pub fn for_tomogram(&self, tomo_num: u32) -> Self {
        if self.scope.is_empty() {
            Self::scoped(format!("tomo {}", tomo_num))
        } else {
            Self::scoped(format!("{} [tomo {}]", self.scope, tomo_num))
        }
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    pub fn record(&self, message: &str) {
        if self.scope.is_empty() {
            info!("{}", message);
        } else {
            info!("{}: {}", self.scope, message);
        }
    }

    pub fn warn(&self, message: &str) {
        if self.scope.is_empty() {
            warn!("{}", message);
        } else {
            warn!("{}: {}", self.scope, message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scopes_nest_per_tomogram() {
        let logger = LogManager::scoped("dose filtering");
        assert_eq!(logger.for_tomogram(4).scope(), "dose filtering [tomo 4]");
        assert_eq!(LogManager::new().for_tomogram(9).scope(), "tomo 9");
    }
}
