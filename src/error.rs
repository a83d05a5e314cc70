use derive_more::Display;

/// Failures raised by the merge node and the layers it dispatches to.
/// Wrapped in `anyhow::Error`, recover with `err.downcast_ref::<MergeError>()`.
#[derive(Debug, Clone, PartialEq, Eq, Display)]
pub enum MergeError {
    /// element-wise combination of buffers with different dimensions
    #[display(fmt = "shape mismatch: expected {:?}, found {:?}", expected, found)]
    ShapeMismatch { expected: Vec<usize>, found: Vec<usize> },
    /// an active merge node has no children to combine
    #[display(fmt = "active merge node has no children")]
    EmptyChildSet,
    /// the handle at `index` outlived the owner responsible for it
    #[display(fmt = "child {} was released by its owner", index)]
    OwnershipViolation { index: usize },
    /// the child at `index` is already borrowed, eg. a merge node containing itself
    #[display(fmt = "child {} is already in use", index)]
    ChildInUse { index: usize },
    #[display(fmt = "unsupported serialization version {}, expected {}", found, expected)]
    Version { expected: u32, found: u32 },
    /// an externally owned node was restored without anyone to own its children
    #[display(fmt = "externally owned merge node restored without an owner for its children")]
    Unowned,
}

impl std::error::Error for MergeError {}

impl MergeError {
    pub fn shape(expected: &[usize], found: &[usize]) -> Self {
        MergeError::ShapeMismatch { expected: expected.to_vec(), found: found.to_vec() }
    }
}

/// Errors with `ShapeMismatch` unless both shapes are identical, never broadcasts
pub fn check_shape(expected: &[usize], found: &[usize]) -> Result<(), MergeError> {
    if expected != found {
        return Err(MergeError::shape(expected, found));
    }
    Ok(())
}

#[test]
fn test_error_display() {
    let err = MergeError::shape(&[2, 2], &[3, 2]);
    assert_eq!(err.to_string(), "shape mismatch: expected [2, 2], found [3, 2]");
    assert!(check_shape(&[2, 2], &[2, 2]).is_ok());
    assert_eq!(check_shape(&[2, 2], &[2, 1]), Err(MergeError::shape(&[2, 2], &[2, 1])));

    let err: anyhow::Error = MergeError::EmptyChildSet.into();
    assert_eq!(err.downcast_ref::<MergeError>(), Some(&MergeError::EmptyChildSet));
    assert_eq!(MergeError::ChildInUse { index: 2 }.to_string(), "child 2 is already in use");
}
