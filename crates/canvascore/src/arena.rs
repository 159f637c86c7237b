use std::collections::BTreeMap;

/// Storage addressed by 1-based monotonic ids. Only live entries take
/// space, and an id is never handed out twice within one graph.
#[derive(Debug, Clone)]
pub(crate) struct Arena<T> {
    entries: BTreeMap<u32, T>,
    /// One past the highest id ever issued or placed.
    next: u64,
}

impl<T> Arena<T> {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            next: 1,
        }
    }

    /// Store the value built for the next fresh id. `None` once every
    /// `u32` id has been used.
    pub fn push_with(&mut self, make: impl FnOnce(u32) -> T) -> Option<u32> {
        let id = u32::try_from(self.next).ok()?;
        self.entries.insert(id, make(id));
        self.next += 1;
        Some(id)
    }

    /// Place a value under a caller-chosen id. Id 0 and ids already in
    /// use are refused and the value handed back.
    pub fn insert_at(&mut self, id: u32, value: T) -> Result<(), T> {
        if id == 0 || self.entries.contains_key(&id) {
            return Err(value);
        }
        self.entries.insert(id, value);
        self.next = self.next.max(u64::from(id) + 1);
        Ok(())
    }

    pub fn get(&self, id: u32) -> Option<&T> {
        self.entries.get(&id)
    }

    pub fn get_mut(&mut self, id: u32) -> Option<&mut T> {
        self.entries.get_mut(&id)
    }

    pub fn remove(&mut self, id: u32) -> Option<T> {
        self.entries.remove(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Live entries in id order.
    pub fn iter(&self) -> impl Iterator<Item = (u32, &T)> {
        self.entries.iter().map(|(id, value)| (*id, value))
    }
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self::new()
    }
}
