//! Per-value type records: the shape/dtype/device/constant lattice.
//!
//! Every field orders `Unknown ⊑ Partial ⊑ Known` by precision. Two
//! operations combine records:
//! - [`TypeRecord::join`] merges facts arriving along different control paths
//!   and moves toward `Unknown` wherever they disagree.
//! - [`TypeRecord::refine`] merges two facts about the *same* value and keeps
//!   the more precise one, so a stored record never loses precision.

use crate::types::{ConstantValue, DataType, Device};

/// Tensors of higher rank are tracked as `Unknown` shape. This bounds the
/// lattice height per value and with it the length of any fixpoint run.
pub const MAX_RANK: usize = 64;

/// Shape knowledge for a tensor value.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ShapeFact {
    /// Nothing is known, not even the rank.
    #[default]
    Unknown,
    /// Rank is known; `None` marks dimensions whose size is unknown.
    Partial(Vec<Option<usize>>),
    /// Every dimension is known.
    Known(Vec<usize>),
}

impl ShapeFact {
    /// Build a shape from per-dimension knowledge, normalizing a fully
    /// specified shape to `Known`.
    pub fn from_dims(dims: Vec<Option<usize>>) -> Self {
        if dims.len() > MAX_RANK {
            return ShapeFact::Unknown;
        }
        if dims.iter().all(Option::is_some) {
            ShapeFact::Known(dims.into_iter().flatten().collect())
        } else {
            ShapeFact::Partial(dims)
        }
    }

    /// A shape of known rank with no known dimension sizes.
    pub fn of_rank(rank: usize) -> Self {
        Self::from_dims(vec![None; rank])
    }

    /// Number of dimensions, if known.
    pub fn rank(&self) -> Option<usize> {
        match self {
            ShapeFact::Unknown => None,
            ShapeFact::Partial(dims) => Some(dims.len()),
            ShapeFact::Known(dims) => Some(dims.len()),
        }
    }

    /// Per-dimension knowledge, if the rank is known.
    pub fn dims(&self) -> Option<Vec<Option<usize>>> {
        match self {
            ShapeFact::Unknown => None,
            ShapeFact::Partial(dims) => Some(dims.clone()),
            ShapeFact::Known(dims) => Some(dims.iter().copied().map(Some).collect()),
        }
    }

    /// Get fully known dimensions if available.
    pub fn as_known(&self) -> Option<&[usize]> {
        match self {
            ShapeFact::Known(dims) => Some(dims),
            _ => None,
        }
    }

    /// Size of one dimension, if known.
    pub fn dim(&self, index: usize) -> Option<usize> {
        match self {
            ShapeFact::Unknown => None,
            ShapeFact::Partial(dims) => dims.get(index).copied().flatten(),
            ShapeFact::Known(dims) => dims.get(index).copied(),
        }
    }

    pub fn is_known(&self) -> bool {
        matches!(self, ShapeFact::Known(_))
    }

    /// Merge shapes from two control paths (meet toward `Unknown`).
    pub fn join(&self, other: &ShapeFact) -> ShapeFact {
        match (self.dims(), other.dims()) {
            (Some(a), Some(b)) if a.len() == b.len() => Self::from_dims(
                a.into_iter()
                    .zip(b)
                    .map(|(x, y)| if x == y { x } else { None })
                    .collect(),
            ),
            _ => ShapeFact::Unknown,
        }
    }

    /// Combine two facts about the same value, keeping known dimensions from
    /// either side. On conflict `self` wins.
    pub fn refine(&self, other: &ShapeFact) -> ShapeFact {
        match (self.dims(), other.dims()) {
            (None, _) => other.clone(),
            (_, None) => self.clone(),
            (Some(a), Some(b)) if a.len() == b.len() => {
                Self::from_dims(a.into_iter().zip(b).map(|(x, y)| x.or(y)).collect())
            }
            _ => self.clone(),
        }
    }

    /// Check `other ⊑ self` in the precision order.
    pub fn is_at_least_as_precise_as(&self, other: &ShapeFact) -> bool {
        match (self.dims(), other.dims()) {
            (_, None) => true,
            (None, Some(_)) => false,
            (Some(a), Some(b)) => {
                a.len() == b.len() && a.iter().zip(&b).all(|(x, y)| y.is_none() || x == y)
            }
        }
    }
}

/// A single-valued fact: either unknown or exactly known.
#[derive(Debug, Clone, PartialEq)]
pub enum Fact<T> {
    Unknown,
    Known(T),
}

impl<T> Default for Fact<T> {
    fn default() -> Self {
        Fact::Unknown
    }
}

impl<T: Clone + PartialEq> Fact<T> {
    pub fn from_option(value: Option<T>) -> Self {
        match value {
            Some(v) => Fact::Known(v),
            None => Fact::Unknown,
        }
    }

    pub fn known(&self) -> Option<&T> {
        match self {
            Fact::Known(v) => Some(v),
            Fact::Unknown => None,
        }
    }

    pub fn is_known(&self) -> bool {
        matches!(self, Fact::Known(_))
    }

    pub fn join(&self, other: &Fact<T>) -> Fact<T> {
        match (self, other) {
            (Fact::Known(a), Fact::Known(b)) if a == b => Fact::Known(a.clone()),
            _ => Fact::Unknown,
        }
    }

    pub fn refine(&self, other: &Fact<T>) -> Fact<T> {
        match self {
            Fact::Known(_) => self.clone(),
            Fact::Unknown => other.clone(),
        }
    }

    pub fn is_at_least_as_precise_as(&self, other: &Fact<T>) -> bool {
        match other {
            Fact::Unknown => true,
            Fact::Known(_) => self == other,
        }
    }
}

/// Lattice element attached to every value.
///
/// `value` is the companion constant-value fact: set when the concrete value
/// (a loop trip count, a permutation's dims, a frozen parameter) is known.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TypeRecord {
    pub shape: ShapeFact,
    pub dtype: Fact<DataType>,
    pub device: Fact<Device>,
    pub value: Fact<ConstantValue>,
}

impl TypeRecord {
    /// The least precise record.
    pub fn unknown() -> Self {
        Self::default()
    }

    /// A tensor record with the given facts.
    pub fn tensor(shape: ShapeFact, dtype: Option<DataType>, device: Option<Device>) -> Self {
        Self {
            shape,
            dtype: Fact::from_option(dtype),
            device: Fact::from_option(device),
            value: Fact::Unknown,
        }
    }

    /// The exact record of a constant.
    pub fn from_constant(value: &ConstantValue) -> Self {
        match value {
            ConstantValue::Tensor(t) => Self {
                shape: ShapeFact::Known(t.shape.clone()),
                dtype: Fact::Known(t.dtype()),
                device: Fact::Known(t.device),
                value: Fact::Known(value.clone()),
            },
            _ => Self {
                value: Fact::Known(value.clone()),
                ..Self::default()
            },
        }
    }

    /// Replace the constant-value fact.
    pub fn with_value(mut self, value: ConstantValue) -> Self {
        self.value = Fact::Known(value);
        self
    }

    /// Drop the constant-value fact, keeping shape/dtype/device.
    pub fn without_value(mut self) -> Self {
        self.value = Fact::Unknown;
        self
    }

    /// The known constant value, if any.
    pub fn constant(&self) -> Option<&ConstantValue> {
        self.value.known()
    }

    /// Merge records from two control paths.
    pub fn join(&self, other: &TypeRecord) -> TypeRecord {
        TypeRecord {
            shape: self.shape.join(&other.shape),
            dtype: self.dtype.join(&other.dtype),
            device: self.device.join(&other.device),
            value: self.value.join(&other.value),
        }
    }

    /// Combine two facts about the same value, field by field.
    pub fn refine(&self, other: &TypeRecord) -> TypeRecord {
        TypeRecord {
            shape: self.shape.refine(&other.shape),
            dtype: self.dtype.refine(&other.dtype),
            device: self.device.refine(&other.device),
            value: self.value.refine(&other.value),
        }
    }

    /// Check `other ⊑ self` in the precision order.
    pub fn is_at_least_as_precise_as(&self, other: &TypeRecord) -> bool {
        self.shape.is_at_least_as_precise_as(&other.shape)
            && self.dtype.is_at_least_as_precise_as(&other.dtype)
            && self.device.is_at_least_as_precise_as(&other.device)
            && self.value.is_at_least_as_precise_as(&other.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_shape_join_moves_toward_unknown() {
        let a = ShapeFact::Known(vec![2, 3]);
        let b = ShapeFact::Known(vec![2, 4]);
        assert_eq!(a.join(&a), a);
        assert_eq!(a.join(&b), ShapeFact::Partial(vec![Some(2), None]));
        assert_eq!(a.join(&ShapeFact::Known(vec![2])), ShapeFact::Unknown);
        assert_eq!(a.join(&ShapeFact::Unknown), ShapeFact::Unknown);
    }

    #[test]
    fn test_shape_refine_keeps_precision() {
        let partial = ShapeFact::Partial(vec![Some(2), None]);
        let other = ShapeFact::Partial(vec![None, Some(5)]);
        assert_eq!(partial.refine(&other), ShapeFact::Known(vec![2, 5]));
        assert_eq!(ShapeFact::Unknown.refine(&partial), partial);
        assert_eq!(partial.refine(&ShapeFact::Unknown), partial);
    }

    #[test]
    fn test_shape_precision_order() {
        let known = ShapeFact::Known(vec![2, 3]);
        let partial = ShapeFact::Partial(vec![Some(2), None]);
        assert!(known.is_at_least_as_precise_as(&partial));
        assert!(!partial.is_at_least_as_precise_as(&known));
        assert!(partial.is_at_least_as_precise_as(&ShapeFact::Unknown));
        assert!(!ShapeFact::Unknown.is_at_least_as_precise_as(&partial));
    }

    #[test]
    fn test_from_dims_normalizes() {
        assert_eq!(
            ShapeFact::from_dims(vec![Some(1), Some(2)]),
            ShapeFact::Known(vec![1, 2])
        );
        assert_eq!(ShapeFact::from_dims(vec![None; MAX_RANK + 1]), ShapeFact::Unknown);
        assert_eq!(ShapeFact::of_rank(0), ShapeFact::Known(vec![]));
    }

    #[test]
    fn test_record_join_and_refine() {
        let a = TypeRecord::tensor(ShapeFact::Known(vec![4]), Some(DataType::F32), Some(Device::Cpu));
        let b = TypeRecord::tensor(ShapeFact::Known(vec![4]), Some(DataType::I64), None);
        let joined = a.join(&b);
        assert_eq!(joined.shape, ShapeFact::Known(vec![4]));
        assert_eq!(joined.dtype, Fact::Unknown);
        assert_eq!(joined.device, Fact::Unknown);

        let refined = joined.refine(&a);
        assert_eq!(refined, a);
        assert!(refined.is_at_least_as_precise_as(&joined));
    }

    #[test]
    fn test_record_from_constant() {
        let record = TypeRecord::from_constant(&ConstantValue::Int(3));
        assert_eq!(record.constant(), Some(&ConstantValue::Int(3)));
        assert_eq!(record.shape, ShapeFact::Unknown);
    }

    fn shape_fact() -> impl Strategy<Value = ShapeFact> {
        prop_oneof![
            Just(ShapeFact::Unknown),
            prop::collection::vec(prop::option::of(1usize..4), 0..4).prop_map(ShapeFact::from_dims),
        ]
    }

    proptest! {
        #[test]
        fn join_is_commutative_and_below_both(a in shape_fact(), b in shape_fact()) {
            let joined = a.join(&b);
            prop_assert_eq!(&joined, &b.join(&a));
            prop_assert!(a.is_at_least_as_precise_as(&joined));
            prop_assert!(b.is_at_least_as_precise_as(&joined));
        }

        #[test]
        fn refine_never_loses_precision(a in shape_fact(), b in shape_fact()) {
            prop_assert!(a.refine(&b).is_at_least_as_precise_as(&a));
            prop_assert_eq!(a.refine(&a), a);
        }
    }
}
