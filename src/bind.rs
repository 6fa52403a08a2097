//! Bind properties and fragment match programs
//!
//! The bind-rule language itself lives outside this crate; a match program
//! here is the already-compiled form, and the only question we answer is
//! whether a fragment part matches a device or not.

use serde::{Deserialize, Serialize};

/// One key/value bind property published by a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceProperty {
    pub key: u32,
    pub value: u32,
}

impl DeviceProperty {
    pub fn new(key: u32, value: u32) -> Self {
        Self { key, value }
    }
}

/// A single instruction of a fragment match program.
///
/// `Match` requires the device to publish an equal property; `Accept`
/// matches any device and is used for wildcard path segments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatchInst {
    Match { key: u32, value: u32 },
    Accept,
}

impl MatchInst {
    fn matches(&self, props: &[DeviceProperty]) -> bool {
        match *self {
            MatchInst::Match { key, value } => {
                props.iter().any(|p| p.key == key && p.value == value)
            }
            MatchInst::Accept => true,
        }
    }
}

/// One part of a fragment descriptor: the match program for one device on
/// the path from the root of the tree to the fragment itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FragmentPart {
    pub match_program: Vec<MatchInst>,
}

impl FragmentPart {
    pub fn new(match_program: Vec<MatchInst>) -> Self {
        Self { match_program }
    }

    /// A part matches a device when every instruction of its program is
    /// satisfied by the device's properties.
    pub fn matches(&self, props: &[DeviceProperty]) -> bool {
        self.match_program.iter().all(|inst| inst.matches(props))
    }
}

/// Evaluate a fragment's parts against a candidate device.
///
/// The last part must match the candidate itself; each earlier part must
/// match the next ancestor walking toward the root. `ancestry` is the
/// property list of the candidate followed by its ancestors, nearest first.
pub fn match_parts(parts: &[FragmentPart], ancestry: &[&[DeviceProperty]]) -> bool {
    if parts.is_empty() || parts.len() > ancestry.len() {
        return false;
    }
    parts
        .iter()
        .rev()
        .zip(ancestry.iter())
        .all(|(part, props)| part.matches(props))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props(pairs: &[(u32, u32)]) -> Vec<DeviceProperty> {
        pairs.iter().map(|&(k, v)| DeviceProperty::new(k, v)).collect()
    }

    #[test]
    fn test_part_matches_equal_property() {
        let part = FragmentPart::new(vec![MatchInst::Match { key: 1, value: 10 }]);
        assert!(part.matches(&props(&[(1, 10), (2, 20)])));
        assert!(!part.matches(&props(&[(1, 11)])));
        assert!(!part.matches(&[]));
    }

    #[test]
    fn test_accept_matches_anything() {
        let part = FragmentPart::new(vec![MatchInst::Accept]);
        assert!(part.matches(&[]));
        assert!(part.matches(&props(&[(9, 9)])));
    }

    #[test]
    fn test_multi_inst_program_requires_all() {
        let part = FragmentPart::new(vec![
            MatchInst::Match { key: 1, value: 10 },
            MatchInst::Match { key: 2, value: 20 },
        ]);
        assert!(part.matches(&props(&[(1, 10), (2, 20)])));
        assert!(!part.matches(&props(&[(1, 10)])));
    }

    #[test]
    fn test_match_parts_against_ancestry() {
        // parts: [bus, device]; ancestry: device first, then its parent.
        let parts = vec![
            FragmentPart::new(vec![MatchInst::Match { key: 100, value: 1 }]),
            FragmentPart::new(vec![MatchInst::Match { key: 1, value: 10 }]),
        ];
        let dev = props(&[(1, 10)]);
        let bus = props(&[(100, 1)]);
        assert!(match_parts(&parts, &[&dev, &bus]));
        // Parent does not carry the bus property.
        let other = props(&[(100, 2)]);
        assert!(!match_parts(&parts, &[&dev, &other]));
    }

    #[test]
    fn test_match_parts_longer_than_ancestry() {
        let parts = vec![
            FragmentPart::new(vec![MatchInst::Accept]),
            FragmentPart::new(vec![MatchInst::Accept]),
        ];
        let dev = props(&[(1, 1)]);
        assert!(!match_parts(&parts, &[&dev]));
    }

    #[test]
    fn test_empty_parts_never_match() {
        let dev = props(&[(1, 1)]);
        assert!(!match_parts(&[], &[&dev]));
    }
}
