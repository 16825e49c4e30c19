use common::Result;

/// Minimal stack interface the benchmark and debug tasks are written against.
pub trait Stack {
    type Value;

    /// Returns `false` when the stack rejected the value for lack of room.
    fn push(&mut self, value: Self::Value) -> Result<bool>;

    /// Returns `default` when the stack was empty.
    fn pop(&mut self, default: Self::Value) -> Result<Self::Value>;
}
