//! Key search over a sorted key column.
//!
//! Keys are compared bytewise and must be non-decreasing. Every flag is
//! answered with one or two binary searches.

/// How [`seek`] resolves a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekKeyFlag {
    /// First position whose key equals the target.
    Exact,
    /// First position whose key is `>=` the target.
    OrNext,
    /// Last position whose key is `<=` the target.
    OrPrev,
    /// First position whose key is `>` the target.
    AfterKey,
    /// Last position whose key is `<` the target.
    BeforeKey,
    /// First position whose key starts with the target.
    Prefix,
    /// Last position whose key starts with the target.
    PrefixLast,
    /// Last position whose key starts with the target, else the last
    /// position before the target.
    PrefixLastOrPrev,
}

/// Searches `keys[start..]` and returns an absolute position.
#[must_use]
pub fn seek<K: AsRef<[u8]>>(
    keys: &[K],
    start: usize,
    key: &[u8],
    flag: SeekKeyFlag,
) -> Option<usize> {
    let tail = keys.get(start..)?;
    let n = tail.len();
    let at = |i: usize| tail[i].as_ref();
    let lower = || tail.partition_point(|k| k.as_ref() < key);
    let upper = || tail.partition_point(|k| k.as_ref() <= key);
    let prefix_end = || tail.partition_point(|k| k.as_ref() < key || k.as_ref().starts_with(key));

    let found = match flag {
        SeekKeyFlag::Exact => Some(lower()).filter(|&i| i < n && at(i) == key),
        SeekKeyFlag::OrNext => Some(lower()).filter(|&i| i < n),
        SeekKeyFlag::OrPrev => upper().checked_sub(1),
        SeekKeyFlag::AfterKey => Some(upper()).filter(|&i| i < n),
        SeekKeyFlag::BeforeKey => lower().checked_sub(1),
        SeekKeyFlag::Prefix => Some(lower()).filter(|&i| i < n && at(i).starts_with(key)),
        SeekKeyFlag::PrefixLast => prefix_end()
            .checked_sub(1)
            .filter(|&i| at(i).starts_with(key)),
        SeekKeyFlag::PrefixLastOrPrev => prefix_end().checked_sub(1),
    };
    found.map(|i| i + start)
}

/// Order-preserving key for a store time in milliseconds.
///
/// The sign bit is flipped so negative times sort before positive ones.
#[must_use]
pub fn stime_key(ms: i64) -> [u8; 8] {
    ((ms as u64) ^ (1 << 63)).to_be_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn keys() -> Vec<&'static [u8]> {
        vec![&b"a"[..], &b"b"[..], &b"b"[..], &b"ba"[..], &b"bb"[..], &b"d"[..]]
    }

    #[test]
    fn exact_and_neighbours() {
        let k = keys();
        assert_eq!(seek(&k, 0, b"b", SeekKeyFlag::Exact), Some(1));
        assert_eq!(seek(&k, 0, b"c", SeekKeyFlag::Exact), None);
        assert_eq!(seek(&k, 0, b"c", SeekKeyFlag::OrNext), Some(5));
        assert_eq!(seek(&k, 0, b"c", SeekKeyFlag::OrPrev), Some(4));
        assert_eq!(seek(&k, 0, b"b", SeekKeyFlag::OrPrev), Some(2));
        assert_eq!(seek(&k, 0, b"b", SeekKeyFlag::AfterKey), Some(3));
        assert_eq!(seek(&k, 0, b"b", SeekKeyFlag::BeforeKey), Some(0));
        assert_eq!(seek(&k, 0, b"a", SeekKeyFlag::BeforeKey), None);
        assert_eq!(seek(&k, 0, b"d", SeekKeyFlag::AfterKey), None);
        assert_eq!(seek(&k, 0, b"e", SeekKeyFlag::OrNext), None);
    }

    #[test]
    fn prefix_flags() {
        let k = keys();
        assert_eq!(seek(&k, 0, b"b", SeekKeyFlag::Prefix), Some(1));
        assert_eq!(seek(&k, 0, b"b", SeekKeyFlag::PrefixLast), Some(4));
        assert_eq!(seek(&k, 0, b"c", SeekKeyFlag::Prefix), None);
        assert_eq!(seek(&k, 0, b"c", SeekKeyFlag::PrefixLast), None);
        assert_eq!(seek(&k, 0, b"c", SeekKeyFlag::PrefixLastOrPrev), Some(4));
        assert_eq!(seek(&k, 0, b"0", SeekKeyFlag::PrefixLastOrPrev), None);
    }

    #[test]
    fn start_limits_the_search() {
        let k = keys();
        assert_eq!(seek(&k, 2, b"b", SeekKeyFlag::Exact), Some(2));
        assert_eq!(seek(&k, 3, b"b", SeekKeyFlag::Exact), None);
        assert_eq!(seek(&k, 3, b"b", SeekKeyFlag::BeforeKey), None);
        assert_eq!(seek(&k, 9, b"b", SeekKeyFlag::OrNext), None);
    }

    #[test]
    fn stime_keys_sort_like_times() {
        let times = [-5_i64, -1, 0, 1, 1_700_000_000_000];
        for pair in times.windows(2) {
            assert!(stime_key(pair[0]) < stime_key(pair[1]));
        }
    }

    proptest! {
        #[test]
        fn flags_agree_with_linear_scan(
            mut raw in prop::collection::vec(0u16..64, 0..40),
            target in 0u16..64,
        ) {
            raw.sort_unstable();
            let keys: Vec<[u8; 2]> = raw.iter().map(|v| v.to_be_bytes()).collect();
            let t = target.to_be_bytes();

            let first = |p: &dyn Fn(&[u8; 2]) -> bool| keys.iter().position(|k| p(k));
            let last = |p: &dyn Fn(&[u8; 2]) -> bool| keys.iter().rposition(|k| p(k));

            prop_assert_eq!(seek(&keys, 0, &t, SeekKeyFlag::Exact), first(&|k| *k == t));
            prop_assert_eq!(seek(&keys, 0, &t, SeekKeyFlag::OrNext), first(&|k| *k >= t));
            prop_assert_eq!(seek(&keys, 0, &t, SeekKeyFlag::OrPrev), last(&|k| *k <= t));
            prop_assert_eq!(seek(&keys, 0, &t, SeekKeyFlag::AfterKey), first(&|k| *k > t));
            prop_assert_eq!(seek(&keys, 0, &t, SeekKeyFlag::BeforeKey), last(&|k| *k < t));
        }
    }
}
