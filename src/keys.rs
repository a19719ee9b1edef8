//! Instance key arithmetic for resources placed more than once in a workspace.

use std::collections::BTreeSet;

use crate::domain::{BaseKey, InstanceKey};

/// Removes a trailing `#<digits>` ordinal, if any.
pub fn strip_instance_suffix(key: &str) -> &str {
    match key.rsplit_once('#') {
        Some((base, suffix)) if !suffix.is_empty() && suffix.chars().all(|ch| ch.is_ascii_digit()) => {
            base
        }
        _ => key,
    }
}

pub fn base_key_of(instance: &InstanceKey) -> BaseKey {
    // InstanceKey is validated on construction, so the stripped form is a valid base key.
    BaseKey::from_validated(strip_instance_suffix(instance.as_str()))
}

/// Ordinal of an instance; the bare base key counts as 1.
pub fn instance_ordinal(instance: &InstanceKey) -> u32 {
    instance
        .as_str()
        .rsplit_once('#')
        .and_then(|(_, suffix)| suffix.parse::<u32>().ok())
        .unwrap_or(1)
}

/// Returns `base` unchanged when no existing key refers to it, otherwise
/// `base#(max ordinal + 1)`. When the maximum is already `u32::MAX` the lowest
/// free ordinal is used instead.
pub fn derive_instance_key<'a, I>(base: &BaseKey, existing: I) -> InstanceKey
where
    I: IntoIterator<Item = &'a InstanceKey>,
{
    let taken = existing
        .into_iter()
        .filter(|key| strip_instance_suffix(key.as_str()) == base.as_str())
        .map(instance_ordinal)
        .collect::<BTreeSet<_>>();
    let Some(&max) = taken.last() else {
        return InstanceKey::from(base.clone());
    };
    let ordinal = max.checked_add(1).unwrap_or_else(|| lowest_free_ordinal(&taken));
    InstanceKey::from_parts(base, ordinal)
}

// `taken` holds at most one entry per placed key, far fewer than u32::MAX,
// so a gap always exists.
fn lowest_free_ordinal(taken: &BTreeSet<u32>) -> u32 {
    (2..=u32::MAX)
        .find(|ordinal| !taken.contains(ordinal))
        .unwrap_or(u32::MAX)
}

pub fn usage_count<'a, I>(base: &BaseKey, all: I) -> usize
where
    I: IntoIterator<Item = &'a InstanceKey>,
{
    all.into_iter()
        .filter(|key| strip_instance_suffix(key.as_str()) == base.as_str())
        .count()
}
