use smallvec::SmallVec;
use smol_str::SmolStr;

/// Hint: the caller never opens conflicting access epochs, so windows do not
/// need to hold the target's attachment table for the whole epoch.
pub const NO_LOCKS: &str = "no_locks";

/// Tuning hints passed to collective window creation.
#[derive(Clone, Debug, Default)]
pub struct Info {
    hints: SmallVec<[(SmolStr, SmolStr); 4]>,
}

impl Info {
    pub fn null() -> Self {
        Self::default()
    }

    /// Set `key` to `value`, replacing an earlier value of the same key.
    pub fn with(mut self, key: &str, value: &str) -> Self {
        match self.hints.iter_mut().find(|(k, _)| k == key) {
            Some((_, v)) => *v = SmolStr::new(value),
            None => self.hints.push((SmolStr::new(key), SmolStr::new(value))),
        }
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.hints
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn flag(&self, key: &str) -> bool {
        matches!(self.get(key), Some("true"))
    }

    pub fn is_empty(&self) -> bool {
        self.hints.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn later_hint_replaces_earlier() {
        let info = Info::null().with(NO_LOCKS, "false").with(NO_LOCKS, "true");
        assert_eq!(info.get(NO_LOCKS), Some("true"));
        assert!(info.flag(NO_LOCKS));
        assert!(!info.flag("missing"));
        assert!(Info::null().is_empty());
    }
}
