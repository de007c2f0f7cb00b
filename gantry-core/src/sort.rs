//! Sort keys and router-side merge ordering.
//!
//! When a query with a sort targets more than one shard, each shard tags the
//! documents it returns with an extracted sort key. The router never inspects
//! document contents during a merge: it orders strictly by these keys. The
//! sort pattern kept on the router is therefore only a list of directions -
//! the field names were consumed when the keys were extracted.

use std::cmp::Ordering;

/// Field name reserved for the extracted sort key in projections.
///
/// A client projection may not name this field; shards use it to attach the
/// extracted key to each returned document.
pub const RESERVED_SORT_KEY_FIELD: &str = "$sortKey";

/// One scalar component of an extracted sort key.
///
/// Components order by type rank first (null, then numbers, then text) and
/// within numbers by numeric value regardless of representation.
#[derive(Debug, Clone)]
pub enum SortValue {
    /// Absent or explicit null component.
    Null,
    /// Signed integer component.
    Int(i64),
    /// Floating-point component (geo-nearest distances arrive as these).
    Double(f64),
    /// Text component.
    Text(String),
}

impl SortValue {
    /// Type rank used before value comparison.
    const fn rank(&self) -> u8 {
        match self {
            Self::Null => 0,
            Self::Int(_) | Self::Double(_) => 1,
            Self::Text(_) => 2,
        }
    }

    fn as_f64(&self) -> f64 {
        match self {
            Self::Null | Self::Text(_) => 0.0,
            #[allow(clippy::cast_precision_loss)]
            Self::Int(v) => *v as f64,
            Self::Double(v) => *v,
        }
    }
}

impl PartialEq for SortValue {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for SortValue {}

impl PartialOrd for SortValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SortValue {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.rank().cmp(&other.rank()) {
            Ordering::Equal => match (self, other) {
                (Self::Null, Self::Null) => Ordering::Equal,
                (Self::Text(a), Self::Text(b)) => a.cmp(b),
                // Numeric components compare by value across representations.
                _ => self.as_f64().total_cmp(&other.as_f64()),
            },
            unequal => unequal,
        }
    }
}

/// An extracted sort key: one component per part of the sort pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortKey(Vec<SortValue>);

impl SortKey {
    /// Creates a sort key from its components.
    #[must_use]
    pub fn new(components: Vec<SortValue>) -> Self {
        Self(components)
    }

    /// Creates a single-component key, as produced for whole-key merges.
    #[must_use]
    pub fn single(component: SortValue) -> Self {
        Self(vec![component])
    }

    /// Returns the component at `index`, treating missing components as null.
    #[must_use]
    pub fn component(&self, index: usize) -> &SortValue {
        self.0.get(index).unwrap_or(&SortValue::Null)
    }

    /// Returns the number of components.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if the key has no components.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Direction of one sort pattern part.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    /// Smallest key first.
    Ascending,
    /// Largest key first.
    Descending,
}

/// The router-side merge ordering: a direction per extracted key component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortPattern {
    parts: Vec<SortDirection>,
    whole_key: bool,
}

impl SortPattern {
    /// Creates a pattern from explicit directions.
    ///
    /// # Panics
    ///
    /// Panics if `parts` is empty; a sortless merge uses no pattern at all.
    #[must_use]
    pub fn new(parts: Vec<SortDirection>) -> Self {
        assert!(!parts.is_empty(), "sort pattern must have at least one part");
        Self {
            parts,
            whole_key: false,
        }
    }

    /// The synthetic single-scalar ascending pattern.
    ///
    /// Used for geo-nearest merges: there is no client sort, and each shard
    /// tags documents with a single distance scalar to order by.
    #[must_use]
    pub fn whole_key() -> Self {
        Self {
            parts: vec![SortDirection::Ascending],
            whole_key: true,
        }
    }

    /// Returns true if this is the synthetic whole-key pattern.
    #[must_use]
    pub const fn is_whole_key(&self) -> bool {
        self.whole_key
    }

    /// Returns the number of pattern parts.
    #[must_use]
    pub fn len(&self) -> usize {
        self.parts.len()
    }

    /// Returns true if the pattern has no parts (never true for valid patterns).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    /// Compares two extracted keys under this pattern.
    #[must_use]
    pub fn compare(&self, a: &SortKey, b: &SortKey) -> Ordering {
        for (index, direction) in self.parts.iter().enumerate() {
            let ordering = a.component(index).cmp(b.component(index));
            let ordering = match direction {
                SortDirection::Ascending => ordering,
                SortDirection::Descending => ordering.reverse(),
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_type_ranks() {
        assert!(SortValue::Null < SortValue::Int(i64::MIN));
        assert!(SortValue::Int(i64::MAX) < SortValue::Text(String::new()));
        assert!(SortValue::Double(f64::MAX) < SortValue::Text("a".to_string()));
    }

    #[test]
    fn test_numeric_cross_type_compare() {
        assert_eq!(SortValue::Int(3), SortValue::Double(3.0));
        assert!(SortValue::Int(3) < SortValue::Double(3.5));
        assert!(SortValue::Double(2.5) < SortValue::Int(3));
    }

    #[test]
    fn test_ascending_compare() {
        let pattern = SortPattern::new(vec![SortDirection::Ascending]);
        let a = SortKey::single(SortValue::Int(1));
        let b = SortKey::single(SortValue::Int(2));
        assert_eq!(pattern.compare(&a, &b), Ordering::Less);
        assert_eq!(pattern.compare(&b, &a), Ordering::Greater);
        assert_eq!(pattern.compare(&a, &a), Ordering::Equal);
    }

    #[test]
    fn test_descending_compare() {
        let pattern = SortPattern::new(vec![SortDirection::Descending]);
        let a = SortKey::single(SortValue::Int(1));
        let b = SortKey::single(SortValue::Int(2));
        assert_eq!(pattern.compare(&a, &b), Ordering::Greater);
    }

    #[test]
    fn test_compound_compare_falls_through_equal_parts() {
        let pattern =
            SortPattern::new(vec![SortDirection::Ascending, SortDirection::Descending]);
        let a = SortKey::new(vec![SortValue::Int(1), SortValue::Int(5)]);
        let b = SortKey::new(vec![SortValue::Int(1), SortValue::Int(9)]);
        // First parts tie; second part descends, so the larger value wins.
        assert_eq!(pattern.compare(&a, &b), Ordering::Greater);
    }

    #[test]
    fn test_missing_component_compares_as_null() {
        let pattern =
            SortPattern::new(vec![SortDirection::Ascending, SortDirection::Ascending]);
        let short = SortKey::single(SortValue::Int(1));
        let long = SortKey::new(vec![SortValue::Int(1), SortValue::Int(0)]);
        assert_eq!(pattern.compare(&short, &long), Ordering::Less);
    }

    #[test]
    fn test_whole_key_pattern() {
        let pattern = SortPattern::whole_key();
        assert!(pattern.is_whole_key());
        assert_eq!(pattern.len(), 1);
        let near = SortKey::single(SortValue::Double(1.5));
        let far = SortKey::single(SortValue::Double(80.0));
        assert_eq!(pattern.compare(&near, &far), Ordering::Less);
    }
}
