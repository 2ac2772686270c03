//! Immutable mappings between label spaces
//!
//! A [`LabelMap`] is built once from static lookup tables and shared
//! read-only for the rest of the run. Moving between label spaces is done by
//! composing maps ([`LabelMap::chain`]) and inverting them
//! ([`LabelMap::invert`]); both return new values, a built map is never
//! mutated. Lookups of absent keys fail loudly, since an unmapped id or name
//! means a corrupted or mismatched configuration table.

use cereb_seg_common::{Result, SegError};
use ndarray::{Array3, Array4, Axis};
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;

/// A finite, explicit mapping `key -> value` between two label spaces
#[derive(Debug, Clone)]
pub struct LabelMap<S, T> {
    entries: Vec<(S, T)>,
    index: HashMap<S, usize>,
}

impl<S, T> LabelMap<S, T>
where
    S: Clone + Eq + Hash + fmt::Debug,
    T: Clone,
{
    /// Build a mapping from key/value pairs, preserving pair order.
    ///
    /// Duplicate keys are rejected: ids must be unique within a space.
    pub fn from_pairs<I>(pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (S, T)>,
    {
        let mut entries = Vec::new();
        let mut index = HashMap::new();
        for (key, value) in pairs {
            if index.contains_key(&key) {
                return Err(SegError::LabelSpace(format!(
                    "duplicate key {key:?} in mapping"
                )));
            }
            index.insert(key.clone(), entries.len());
            entries.push((key, value));
        }
        Ok(Self { entries, index })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn contains(&self, key: &S) -> bool {
        self.index.contains_key(key)
    }

    #[must_use]
    pub fn get(&self, key: &S) -> Option<&T> {
        self.index.get(key).map(|&i| &self.entries[i].1)
    }

    /// Look up a key that is required to exist
    pub fn require(&self, key: &S) -> Result<&T> {
        self.get(key).ok_or_else(|| {
            SegError::LabelSpace(format!("key {key:?} is absent from the mapping"))
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = (&S, &T)> {
        self.entries.iter().map(|(key, value)| (key, value))
    }

    pub fn keys(&self) -> impl Iterator<Item = &S> {
        self.entries.iter().map(|(key, _)| key)
    }

    pub fn values(&self) -> impl Iterator<Item = &T> {
        self.entries.iter().map(|(_, value)| value)
    }

    /// Compose this mapping (A -> B) with `next` (B -> C) into A -> C.
    ///
    /// Strict policy: every value of `self` must be a key of `next`; a
    /// codomain/domain mismatch is a configuration error, entries are never
    /// silently dropped or passed through.
    pub fn chain<U>(&self, next: &LabelMap<T, U>) -> Result<LabelMap<S, U>>
    where
        T: Eq + Hash + fmt::Debug,
        U: Clone,
    {
        let mut pairs = Vec::with_capacity(self.len());
        for (key, value) in &self.entries {
            let target = next.get(value).ok_or_else(|| {
                SegError::LabelSpace(format!(
                    "cannot chain mappings: value {value:?} (of key {key:?}) is absent \
                     from the next mapping"
                ))
            })?;
            pairs.push((key.clone(), target.clone()));
        }
        LabelMap::from_pairs(pairs)
    }

    /// Invert the mapping; fails unless it is injective
    pub fn invert(&self) -> Result<LabelMap<T, S>>
    where
        T: Clone + Eq + Hash + fmt::Debug,
    {
        LabelMap::from_pairs(
            self.entries
                .iter()
                .map(|(key, value)| (value.clone(), key.clone())),
        )
        .map_err(|e| SegError::LabelSpace(format!("cannot invert non-injective mapping: {e}")))
    }
}

/// Direction of a channel-axis remap, see [`LabelMap::map_logit_channels`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelMapDirection {
    /// `out[value] = in[key]`; requires an injective mapping
    Collapse,
    /// `out[key] = in[value]`; reconstitutes a reduced class set into the
    /// full set (the sagittal case)
    Expand,
}

impl LabelMap<i64, i64> {
    /// Remap a volume of ids element-wise, failing on any unmapped id
    pub fn apply_volume(&self, volume: &Array3<i64>) -> Result<Array3<i64>> {
        let mut out = Array3::zeros(volume.raw_dim());
        for (target, source) in out.iter_mut().zip(volume.iter()) {
            *target = *self.require(source)?;
        }
        Ok(out)
    }

    /// Remap an entire channel axis of a logit tensor by gathering source
    /// channels into destination channels.
    ///
    /// The mapping is read as `full-class id -> reduced-class id`. With
    /// [`ChannelMapDirection::Expand`] the output grows back to the full
    /// class count and every full-class channel takes its value from the
    /// reduced channel it maps to. Gaps in the destination channel range and
    /// out-of-range source channels fail loudly.
    pub fn map_logit_channels(
        &self,
        logits: &Array4<f32>,
        axis: usize,
        direction: ChannelMapDirection,
    ) -> Result<Array4<f32>> {
        let mut gather: Vec<(usize, usize)> = Vec::with_capacity(self.len());
        for (&key, &value) in self.iter() {
            if key < 0 || value < 0 {
                return Err(SegError::LabelSpace(format!(
                    "negative id in channel mapping: {key} -> {value}"
                )));
            }
            let (dst, src) = match direction {
                ChannelMapDirection::Collapse => (value as usize, key as usize),
                ChannelMapDirection::Expand => (key as usize, value as usize),
            };
            gather.push((dst, src));
        }

        let out_channels = gather
            .iter()
            .map(|&(dst, _)| dst + 1)
            .max()
            .ok_or_else(|| SegError::LabelSpace("empty channel mapping".to_string()))?;
        let mut covered = vec![false; out_channels];
        let in_channels = logits.shape()[axis];
        for &(dst, src) in &gather {
            if covered[dst] {
                return Err(SegError::LabelSpace(format!(
                    "destination channel {dst} is mapped twice"
                )));
            }
            covered[dst] = true;
            if src >= in_channels {
                return Err(SegError::LabelSpace(format!(
                    "source channel {src} is out of range (tensor has {in_channels})"
                )));
            }
        }
        if let Some(hole) = covered.iter().position(|&c| !c) {
            return Err(SegError::LabelSpace(format!(
                "no source channel maps to destination channel {hole}"
            )));
        }

        let mut dim = logits.raw_dim();
        dim[axis] = out_channels;
        let mut out = Array4::zeros(dim);
        for &(dst, src) in &gather {
            out.index_axis_mut(Axis(axis), dst)
                .assign(&logits.index_axis(Axis(axis), src));
        }
        Ok(out)
    }
}
