//! C3 method resolution order.

use opal_core::ObjRef;

/// Inconsistent class hierarchy: no linearization exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MroError;

impl std::fmt::Display for MroError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "cannot create a consistent method resolution order for the given bases"
        )
    }
}

/// Compute the C3 linearization of a new type.
///
/// `bases_mros` holds the cached MRO of each direct base, in declaration
/// order. The new type itself is prepended by the caller. MROs are
/// computed eagerly when a type is created and cached on the type
/// object; lookups never re-linearize.
pub fn compute_c3_mro(bases_mros: &[Vec<ObjRef>]) -> Result<Vec<ObjRef>, MroError> {
    // Sequences to merge: every base's MRO plus the list of bases.
    let mut sequences: Vec<Vec<ObjRef>> = bases_mros.to_vec();
    sequences.push(bases_mros.iter().filter_map(|m| m.first().copied()).collect());

    let mut result = Vec::new();
    loop {
        sequences.retain(|s| !s.is_empty());
        if sequences.is_empty() {
            return Ok(result);
        }

        // A good head appears in no other sequence's tail.
        let head = sequences
            .iter()
            .map(|s| s[0])
            .find(|candidate| {
                sequences
                    .iter()
                    .all(|s| !s[1..].contains(candidate))
            })
            .ok_or(MroError)?;

        result.push(head);
        for s in &mut sequences {
            s.retain(|c| *c != head);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obj(n: u32) -> ObjRef {
        ObjRef::from_index(n)
    }

    #[test]
    fn test_single_inheritance_chain() {
        // A(object); B(A): B's mro = [B computed by caller] merge of A's.
        let object = obj(0);
        let a = obj(1);
        let a_mro = vec![a, object];
        let mro = compute_c3_mro(&[a_mro]).unwrap();
        assert_eq!(mro, vec![a, object]);
    }

    #[test]
    fn test_diamond() {
        // class B(A); class C(A); class D(B, C)
        let object = obj(0);
        let a = obj(1);
        let b = obj(2);
        let c = obj(3);
        let b_mro = vec![b, a, object];
        let c_mro = vec![c, a, object];
        let mro = compute_c3_mro(&[b_mro, c_mro]).unwrap();
        assert_eq!(mro, vec![b, c, a, object]);
    }

    #[test]
    fn test_inconsistent_hierarchy() {
        // Merge of [a, b] and [b, a] has no valid head ordering.
        let a = obj(1);
        let b = obj(2);
        assert_eq!(compute_c3_mro(&[vec![a, b], vec![b, a]]), Err(MroError));
    }

    #[test]
    fn test_no_bases() {
        assert_eq!(compute_c3_mro(&[]).unwrap(), Vec::<ObjRef>::new());
    }
}
