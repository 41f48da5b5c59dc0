strong_type!(
    /// Index of a worker inside the environment's fixed worker array.
    WorkerId,
    u16
);
strong_type!(
    /// Process-unique sequence component of a descriptor.
    Sequence,
    u64
);

impl WorkerId {
    /// Position of this worker in the worker array.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_index() {
        assert_eq!(WorkerId(3).index(), 3);
        assert_eq!(format!("{:?}", WorkerId(3)), "WorkerId(3)");
    }

    #[test]
    fn test_sequence_ordering() {
        assert!(Sequence(1) < Sequence(2));
        assert_eq!(Sequence::default(), Sequence(0));
    }
}
