//! Selection strategies over dynamic pools of schedulable items.

pub mod classed;
pub use classed::{ClassedSelector, ClassifyItem};
pub mod weighted;
pub use weighted::WeightedSelector;

use core::hash::Hash;

use hashbrown::HashMap;
use libafl_bolts::{
    current_nanos,
    rands::{Rand, StdRand},
    Error,
};

/// Picks one element from a pool that grows and shrinks while a session runs.
///
/// Selection from an empty pool is a caller error; check [`Selector::is_empty`]
/// first. [`Selector::select`] returns [`Error::empty`] in that case rather
/// than a meaningless element.
pub trait Selector<T> {
    /// Add an item to the pool. Inserting an already present item is a no-op.
    fn insert(&mut self, item: T);

    /// Remove an item from the pool, reporting whether it was present.
    fn remove(&mut self, item: &T) -> bool;

    /// Pick one item, leaving it in the pool.
    fn select(&mut self) -> Result<T, Error>;

    /// Number of items currently in the pool.
    fn len(&self) -> usize;

    /// Whether the pool holds no items.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Recompute every item's cached selection weight with the given score
    /// function. Strategies without weights ignore this.
    fn update_weights<F>(&mut self, score: F)
    where
        F: FnMut(&T) -> f64,
        Self: Sized,
    {
        let _ = score;
    }

    /// Append every pooled item to `out`.
    fn copy_into(&self, out: &mut Vec<T>);

    /// Drop every item.
    fn clear(&mut self);
}

/// Uniform random selection.
#[derive(Debug)]
pub struct RandSelector<T> {
    items: Vec<T>,
    index: HashMap<T, usize>,
    rand: StdRand,
}

impl<T> RandSelector<T>
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
            rand,
        }
    }

    /// Whether the item is currently pooled.
    #[must_use]
    pub fn contains(&self, item: &T) -> bool {
        self.index.contains_key(item)
    }
}

impl<T> Default for RandSelector<T>
where
    T: Copy + Eq + Hash,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Selector<T> for RandSelector<T>
where
    T: Copy + Eq + Hash,
{
    fn insert(&mut self, item: T) {
        if self.index.contains_key(&item) {
            return;
        }
        self.index.insert(item, self.items.len());
        self.items.push(item);
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
        true
    }

    fn select(&mut self) -> Result<T, Error> {
        if self.items.is_empty() {
            return Err(Error::empty("no items to select from"));
        }
        let pos = self.rand.below(self.items.len());
        Ok(self.items[pos])
    }

    fn len(&self) -> usize {
        self.items.len()
    }

    fn copy_into(&self, out: &mut Vec<T>) {
        out.extend_from_slice(&self.items);
    }

    fn clear(&mut self) {
        self.items.clear();
        self.index.clear();
    }
}
