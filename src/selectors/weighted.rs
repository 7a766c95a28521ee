//! Weighted random selection over a pool of schedulable items.

use core::hash::Hash;

use hashbrown::HashMap;
use libafl_bolts::{
    current_nanos,
    rands::{Rand, StdRand},
    Error,
};

use crate::selectors::Selector;

/// Roulette selection: each item is drawn with probability proportional to
/// its weight.
///
/// Weights default to 1.0 on insertion and are recomputed in bulk through
/// [`Selector::update_weights`] with a caller-supplied score function, so the
/// caller decides what "heavy" means.
#[derive(Debug)]
pub struct WeightedSelector<T> {
    items: Vec<T>,
    index: HashMap<T, usize>,
    weights: HashMap<T, f64>,
    total: f64,
    rand: StdRand,
}

impl<T> WeightedSelector<T>
where
    T: Copy + Eq + Hash,
{
    /// Create a selector seeded from the wall clock.
    #[must_use]
    pub fn new() -> Self {
        Self::with_rand(StdRand::with_seed(current_nanos()))
    }

    /// Create a selector drawing from the given generator.
    #[must_use]
    pub fn with_rand(rand: StdRand) -> Self {
        Self {
            items: Vec::new(),
            index: HashMap::new(),
            weights: HashMap::new(),
            total: 0.0,
            rand,
        }
    }

    /// The item's current selection weight, if pooled.
    #[must_use]
    pub fn weight_of(&self, item: &T) -> Option<f64> {
        self.weights.get(item).copied()
    }
}

impl<T> Default for WeightedSelector<T>
where
    T: Copy + Eq + Hash,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Selector<T> for WeightedSelector<T>
where
    T: Copy + Eq + Hash,
{
    fn insert(&mut self, item: T) {
        if self.index.contains_key(&item) {
            return;
        }
        self.index.insert(item, self.items.len());
        self.items.push(item);
        self.weights.insert(item, 1.0);
        self.total += 1.0;
    }

    fn remove(&mut self, item: &T) -> bool {
        let Some(pos) = self.index.remove(item) else {
            return false;
        };
        self.items.swap_remove(pos);
        if pos < self.items.len() {
            let moved = self.items[pos];
            self.index.insert(moved, pos);
        }
        if let Some(weight) = self.weights.remove(item) {
            self.total = (self.total - weight).max(0.0);
        }
        if self.items.is_empty() {
            self.total = 0.0;
        }
        true
    }

    fn select(&mut self) -> Result<T, Error> {
        if self.items.is_empty() {
            return Err(Error::empty("no items to select from"));
        }
        let threshold = self.total * self.rand.next_float();
        let mut accumulated = 0.0;
        let mut ret = self.items[self.items.len() - 1];
        for item in &self.items {
            accumulated += self.weights.get(item).copied().unwrap_or_default();
            if accumulated >= threshold {
                ret = *item;
                break;
            }
        }
        Ok(ret)
    }

    fn len(&self) -> usize {
        self.items.len()
    }

    fn update_weights<F>(&mut self, mut score: F)
    where
        F: FnMut(&T) -> f64,
    {
        self.total = 0.0;
        for item in &self.items {
            let weight = score(item);
            debug_assert!(
                weight >= 0.0 && weight.is_finite(),
                "selection weight must be finite and >= 0.0"
            );
            self.weights.insert(*item, weight);
            self.total += weight;
        }
    }

    fn copy_into(&self, out: &mut Vec<T>) {
        out.extend_from_slice(&self.items);
    }

    fn clear(&mut self) {
        self.items.clear();
        self.index.clear();
        self.weights.clear();
        self.total = 0.0;
    }
}

#[cfg(test)]
mod tests {
    use libafl_bolts::rands::StdRand;

    use super::WeightedSelector;
    use crate::selectors::Selector;

    #[test]
    fn weights_steer_selection() {
        // the first 3 draws of this seed land at .76, .86, .36
        let mut selector = WeightedSelector::with_rand(StdRand::with_seed(2));
        selector.insert(1_u32);
        selector.insert(2_u32);
        selector.update_weights(|item| if *item == 2 { 1.0 } else { 0.0 });

        for _ in 0..3 {
            assert_eq!(selector.select().unwrap(), 2);
        }
    }

    #[test]
    fn insertion_defaults_to_unit_weight() {
        let mut selector = WeightedSelector::with_rand(StdRand::with_seed(2));
        selector.insert(7_u32);
        assert!((selector.weight_of(&7).unwrap() - 1.0).abs() < f64::EPSILON);
        assert_eq!(selector.len(), 1);
        assert_eq!(selector.select().unwrap(), 7);
    }

    #[test]
    fn removal_keeps_total_consistent() {
        let mut selector = WeightedSelector::with_rand(StdRand::with_seed(5));
        selector.insert(1_u32);
        selector.insert(2_u32);
        selector.insert(3_u32);
        selector.update_weights(|item| f64::from(*item));

        assert!(selector.remove(&3));
        assert!(selector.weight_of(&3).is_none());
        for _ in 0..16 {
            assert_ne!(selector.select().unwrap(), 3);
        }

        assert!(selector.remove(&1));
        assert!(selector.remove(&2));
        assert!(selector.select().is_err());
    }
}
