//! Two-level selection: pick a class of items first, then an item within it.

use core::{fmt::Debug, hash::Hash, marker::PhantomData};

use hashbrown::HashMap;
use libafl_bolts::Error;

use crate::selectors::{RandSelector, Selector};

/// Assigns every item to a selection class.
pub trait ClassifyItem<T> {
    /// The class key type.
    type Class: Copy + Eq + Hash + Debug;

    /// The class the item belongs to.
    fn classify(item: &T) -> Self::Class;
}

/// Selects in two stages: a class via the inner class selector, then a member
/// of that class uniformly. Classes that run out of members are pruned, so
/// the class stage never lands on an empty class.
#[derive(Debug)]
pub struct ClassedSelector<T, C, CS>
where
    C: ClassifyItem<T>,
{
    classes: CS,
    members: HashMap<C::Class, RandSelector<T>>,
    len: usize,
    phantom: PhantomData<C>,
}

impl<T, C> ClassedSelector<T, C, RandSelector<C::Class>>
where
    T: Copy + Eq + Hash,
    C: ClassifyItem<T>,
{
    /// Create a selector that picks classes uniformly.
    #[must_use]
    pub fn new() -> Self {
        Self::with_class_selector(RandSelector::new())
    }
}

impl<T, C> Default for ClassedSelector<T, C, RandSelector<C::Class>>
where
    T: Copy + Eq + Hash,
    C: ClassifyItem<T>,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T, C, CS> ClassedSelector<T, C, CS>
where
    T: Copy + Eq + Hash,
    C: ClassifyItem<T>,
    CS: Selector<C::Class>,
{
    /// Create a selector with a custom class-stage strategy.
    #[must_use]
    pub fn with_class_selector(classes: CS) -> Self {
        Self {
            classes,
            members: HashMap::new(),
            len: 0,
            phantom: PhantomData,
        }
    }

    /// Number of non-empty classes.
    #[must_use]
    pub fn class_count(&self) -> usize {
        self.members.len()
    }
}

impl<T, C, CS> Selector<T> for ClassedSelector<T, C, CS>
where
    T: Copy + Eq + Hash,
    C: ClassifyItem<T>,
    CS: Selector<C::Class>,
{
    fn insert(&mut self, item: T) {
        let class = C::classify(&item);
        let members = self.members.entry(class).or_default();
        if members.is_empty() {
            self.classes.insert(class);
        }
        if !members.contains(&item) {
            members.insert(item);
            self.len += 1;
        }
    }

    fn remove(&mut self, item: &T) -> bool {
        let class = C::classify(item);
        let Some(members) = self.members.get_mut(&class) else {
            return false;
        };
        if !members.remove(item) {
            return false;
        }
        self.len -= 1;
        if members.is_empty() {
            self.members.remove(&class);
            self.classes.remove(&class);
        }
        true
    }

    fn select(&mut self) -> Result<T, Error> {
        if self.len == 0 {
            return Err(Error::empty("no items to select from"));
        }
        let class = self.classes.select()?;
        let members = self
            .members
            .get_mut(&class)
            .ok_or_else(|| Error::key_not_found("selected class has no member pool"))?;
        members.select()
    }

    fn len(&self) -> usize {
        self.len
    }

    fn copy_into(&self, out: &mut Vec<T>) {
        for members in self.members.values() {
            members.copy_into(out);
        }
    }

    fn clear(&mut self) {
        self.classes.clear();
        self.members.clear();
        self.len = 0;
    }
}
