//! Gauge channel selection and labels.
//!
//! Selections accept the forms operators type at the bench:
//!
//! - `all` or `*`: every valid channel, ascending
//! - `4,5,6` or `1 4 6`: explicit ids
//! - `1-3,6` or `6-4`: ascending or descending ranges
//!
//! Duplicates are dropped, keeping the first occurrence.

use std::collections::BTreeMap;
use std::fmt;

use thiserror::Error;

use crate::hardware::ChannelId;

/// Channels wired on the standard six-gauge fixture.
pub const DEFAULT_VALID_CHANNELS: [ChannelId; 6] = [1, 2, 3, 4, 5, 6];

/// Built-in label for a channel on the standard fixture.
pub fn default_label(id: ChannelId) -> String {
    match id {
        1 => "Z direction 1".to_string(),
        2 => "Z direction 2".to_string(),
        3 => "Z direction 3".to_string(),
        4 => "X direction 1".to_string(),
        5 => "X direction 2".to_string(),
        6 => "Y direction".to_string(),
        other => format!("Gauge {other}"),
    }
}

/// One gauge address with its display label.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Channel {
    /// Gauge address on the module.
    pub id: ChannelId,
    /// Column header and log label.
    pub label: String,
}

impl Channel {
    /// Channel with the built-in label.
    pub fn new(id: ChannelId) -> Self {
        Self {
            id,
            label: default_label(id),
        }
    }

    /// Channel with an explicit label; an empty label falls back to the default.
    pub fn labelled(id: ChannelId, label: impl Into<String>) -> Self {
        let label = label.into();
        if label.trim().is_empty() {
            Self::new(id)
        } else {
            Self { id, label }
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} ({})", self.id, self.label)
    }
}

/// Rejected channel selection.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    /// Nothing was selected.
    #[error("channel selection cannot be empty")]
    Empty,
    /// A token is neither an id nor a range.
    #[error("invalid channel token '{0}'")]
    InvalidToken(String),
    /// A range token is missing an end.
    #[error("invalid range token '{0}'")]
    InvalidRange(String),
    /// An id outside the valid set.
    #[error("invalid channel #{id}; valid channels: {valid:?}")]
    NotValid {
        /// Requested id.
        id: ChannelId,
        /// The valid set.
        valid: Vec<ChannelId>,
    },
    /// `--count` outside `1..=valid.len()`.
    #[error("channel count must be between 1 and {max}, got {count}")]
    CountOutOfRange {
        /// Requested count.
        count: usize,
        /// Number of valid channels.
        max: usize,
    },
}

/// Ordered, duplicate-free list of selected channel ids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSelection(Vec<ChannelId>);

impl ChannelSelection {
    /// Parse a selection string against the valid channel set.
    pub fn parse(input: &str, valid: &[ChannelId]) -> Result<Self, ChannelError> {
        let s = input.trim().to_ascii_lowercase();
        if s.is_empty() {
            return Err(ChannelError::Empty);
        }
        if s == "all" || s == "*" {
            let mut all = valid.to_vec();
            all.sort_unstable();
            all.dedup();
            return if all.is_empty() {
                Err(ChannelError::Empty)
            } else {
                Ok(Self(all))
            };
        }

        let mut ids = Vec::new();
        let mut add = |id: ChannelId| -> Result<(), ChannelError> {
            if !valid.contains(&id) {
                return Err(ChannelError::NotValid {
                    id,
                    valid: valid.to_vec(),
                });
            }
            if !ids.contains(&id) {
                ids.push(id);
            }
            Ok(())
        };

        for token in s.split(|c: char| c == ',' || c.is_whitespace()) {
            if token.is_empty() {
                continue;
            }
            if let Some((a, b)) = token.split_once('-') {
                if a.is_empty() || b.is_empty() {
                    return Err(ChannelError::InvalidRange(token.to_string()));
                }
                let start: ChannelId = a
                    .parse()
                    .map_err(|_| ChannelError::InvalidRange(token.to_string()))?;
                let end: ChannelId = b
                    .parse()
                    .map_err(|_| ChannelError::InvalidRange(token.to_string()))?;
                if start <= end {
                    for id in start..=end {
                        add(id)?;
                    }
                } else {
                    for id in (end..=start).rev() {
                        add(id)?;
                    }
                }
            } else {
                let id: ChannelId = token
                    .parse()
                    .map_err(|_| ChannelError::InvalidToken(token.to_string()))?;
                add(id)?;
            }
        }

        if ids.is_empty() {
            return Err(ChannelError::Empty);
        }
        Ok(Self(ids))
    }

    /// The first `count` valid channels.
    pub fn first(count: usize, valid: &[ChannelId]) -> Result<Self, ChannelError> {
        if count == 0 || count > valid.len() {
            return Err(ChannelError::CountOutOfRange {
                count,
                max: valid.len(),
            });
        }
        Ok(Self(valid[..count].to_vec()))
    }

    /// Selected ids in order.
    pub fn ids(&self) -> &[ChannelId] {
        &self.0
    }

    /// Attach labels; ids without a configured label get the built-in one.
    pub fn into_channels(self, labels: &BTreeMap<ChannelId, String>) -> Vec<Channel> {
        self.0
            .into_iter()
            .map(|id| match labels.get(&id) {
                Some(label) => Channel::labelled(id, label.clone()),
                None => Channel::new(id),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(s: &str) -> Result<Vec<ChannelId>, ChannelError> {
        ChannelSelection::parse(s, &DEFAULT_VALID_CHANNELS).map(|sel| sel.ids().to_vec())
    }

    #[test]
    fn test_parse_forms() {
        assert_eq!(parse("4,5,6").unwrap(), vec![4, 5, 6]);
        assert_eq!(parse("1 4 6").unwrap(), vec![1, 4, 6]);
        assert_eq!(parse("1-3,6").unwrap(), vec![1, 2, 3, 6]);
        assert_eq!(parse("6-4").unwrap(), vec![6, 5, 4]);
        assert_eq!(parse(" ALL ").unwrap(), vec![1, 2, 3, 4, 5, 6]);
        assert_eq!(parse("*").unwrap(), vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_parse_dedups_preserving_order() {
        assert_eq!(parse("3, 1-3, 3").unwrap(), vec![3, 1, 2]);
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(parse(""), Err(ChannelError::Empty));
        assert_eq!(parse(" , "), Err(ChannelError::Empty));
        assert_eq!(parse("x"), Err(ChannelError::InvalidToken("x".into())));
        assert_eq!(parse("1-"), Err(ChannelError::InvalidRange("1-".into())));
        assert_eq!(parse("a-3"), Err(ChannelError::InvalidRange("a-3".into())));
        assert!(matches!(parse("7"), Err(ChannelError::NotValid { id: 7, .. })));
        assert!(matches!(parse("5-8"), Err(ChannelError::NotValid { id: 7, .. })));
    }

    #[test]
    fn test_first_n() {
        let sel = ChannelSelection::first(2, &DEFAULT_VALID_CHANNELS).unwrap();
        assert_eq!(sel.ids(), &[1, 2]);
        assert!(ChannelSelection::first(0, &DEFAULT_VALID_CHANNELS).is_err());
        assert_eq!(
            ChannelSelection::first(7, &DEFAULT_VALID_CHANNELS),
            Err(ChannelError::CountOutOfRange { count: 7, max: 6 })
        );
    }

    #[test]
    fn test_labels() {
        let mut labels = BTreeMap::new();
        labels.insert(2, "left arm".to_string());
        labels.insert(3, "   ".to_string());
        let channels = parse("1-3")
            .map(|ids| ChannelSelection(ids).into_channels(&labels))
            .unwrap();
        assert_eq!(channels[0].label, "Z direction 1");
        assert_eq!(channels[1].label, "left arm");
        assert_eq!(channels[2].label, "Z direction 3");
        assert_eq!(default_label(9), "Gauge 9");
    }
}
