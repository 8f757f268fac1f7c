//! Fixed-depth shift register.

/// Returns the value pushed `depth` calls earlier.
///
/// Until `depth` values have gone in, `push` returns the configured default.
/// A depth of zero is a passthrough.
#[derive(Debug, Clone)]
pub struct DelayLine<T> {
    slots: Vec<T>,
    cursor: usize,
}

impl<T: Clone> DelayLine<T> {
    /// Create a delay line primed with `depth` copies of `default`.
    pub fn new(depth: usize, default: T) -> Self {
        Self {
            slots: vec![default; depth],
            cursor: 0,
        }
    }

    /// Number of pushes between a value going in and coming out.
    pub fn depth(&self) -> usize {
        self.slots.len()
    }

    /// Shift `value` in and return the value from `depth` pushes ago.
    pub fn push(&mut self, value: T) -> T {
        let depth = self.slots.len();
        match self.slots.get_mut(self.cursor) {
            Some(slot) => {
                let oldest = std::mem::replace(slot, value);
                self.cursor = (self.cursor + 1) % depth;
                oldest
            }
            None => value,
        }
    }

    /// Value that the next `push` will return.
    pub fn peek(&self) -> Option<&T> {
        self.slots.get(self.cursor)
    }

    /// Refill every slot with `value`.
    pub fn reset(&mut self, value: T) {
        self.slots.fill(value);
        self.cursor = 0;
    }
}
