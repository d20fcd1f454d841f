use super::Label;

const INITIAL_CAPACITY: usize = 64;

/// Open-addressing map keyed by [`Label`].
///
/// Linear probing over a power-of-two table; grows once two thirds full.
/// Removal shifts the following cluster back instead of leaving tombstones.
pub struct LabelMap<V> {
    slots: Vec<Option<(Label, V)>>,
    len: usize,
}

impl<V> Default for LabelMap<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> LabelMap<V> {
    pub fn new() -> Self {
        Self::with_capacity(INITIAL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(2).next_power_of_two();
        LabelMap {
            slots: (0..capacity).map(|_| None).collect(),
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn mask(&self) -> usize {
        self.slots.len() - 1
    }

    fn bucket(&self, label: Label) -> usize {
        (label.raw().wrapping_mul(17) as usize) & self.mask()
    }

    fn find(&self, label: Label) -> Option<usize> {
        let mut index = self.bucket(label);
        loop {
            match &self.slots[index] {
                Some((key, _)) if *key == label => return Some(index),
                Some(_) => index = (index + 1) & self.mask(),
                None => return None,
            }
        }
    }

    pub fn get(&self, label: Label) -> Option<&V> {
        let index = self.find(label)?;
        self.slots[index].as_ref().map(|(_, v)| v)
    }

    pub fn get_mut(&mut self, label: Label) -> Option<&mut V> {
        let index = self.find(label)?;
        self.slots[index].as_mut().map(|(_, v)| v)
    }

    pub fn contains(&self, label: Label) -> bool {
        self.find(label).is_some()
    }

    /// Inserts `value`, returning the previous value for `label` if any.
    pub fn insert(&mut self, label: Label, value: V) -> Option<V> {
        if let Some(index) = self.find(label) {
            return self.slots[index]
                .replace((label, value))
                .map(|(_, old)| old);
        }
        let index = self.vacant_slot(label);
        self.slots[index] = Some((label, value));
        self.len += 1;
        None
    }

    pub fn get_or_insert_with(&mut self, label: Label, make: impl FnOnce() -> V) -> &mut V {
        let index = match self.find(label) {
            Some(index) => index,
            None => {
                let index = self.vacant_slot(label);
                self.slots[index] = Some((label, make()));
                self.len += 1;
                index
            }
        };
        match &mut self.slots[index] {
            Some((_, value)) => value,
            None => unreachable!("slot {} was just filled", index),
        }
    }

    pub fn remove(&mut self, label: Label) -> Option<V> {
        let mut hole = self.find(label)?;
        let (_, removed) = self.slots[hole].take()?;
        self.len -= 1;

        let mask = self.mask();
        let mut next = (hole + 1) & mask;
        while let Some((key, _)) = &self.slots[next] {
            let home = self.bucket(*key);
            // Shift back unless the entry's home lies cyclically in (hole, next].
            let stays = if hole <= next {
                hole < home && home <= next
            } else {
                hole < home || home <= next
            };
            if !stays {
                self.slots[hole] = self.slots[next].take();
                hole = next;
            }
            next = (next + 1) & mask;
        }

        Some(removed)
    }

    pub fn iter(&self) -> impl Iterator<Item = (Label, &V)> {
        self.slots
            .iter()
            .filter_map(|slot| slot.as_ref().map(|(k, v)| (*k, v)))
    }

    /// Finds the slot for a new key, growing the table first if needed.
    fn vacant_slot(&mut self, label: Label) -> usize {
        if (self.len + 1) * 3 > self.slots.len() * 2 {
            self.grow();
        }
        let mut index = self.bucket(label);
        while self.slots[index].is_some() {
            index = (index + 1) & self.mask();
        }
        index
    }

    fn grow(&mut self) {
        let doubled = self.slots.len() * 2;
        let old = std::mem::replace(&mut self.slots, (0..doubled).map(|_| None).collect());
        for (label, value) in old.into_iter().flatten() {
            let mut index = self.bucket(label);
            while self.slots[index].is_some() {
                index = (index + 1) & self.mask();
            }
            self.slots[index] = Some((label, value));
        }
    }
}
