//! Canonical member signatures
//!
//! One format serves as both the external map key and the trie input:
//! `name;param1;param2;...` with constructors spelled `<init>`. The `';'`
//! delimiter is part of the contract; a signature with no parameters still
//! carries the trailing delimiter after its name (`get;` vs `getName;`
//! disambiguate by content, not position).

use weft_vm::TypeRef;

/// Name used for constructors in signatures.
pub const CTOR_NAME: &str = "<init>";

/// Canonical signature of a named member.
pub fn signature(name: &str, params: &[TypeRef]) -> String {
    let mut out = String::with_capacity(name.len() + 1 + params.len() * 8);
    out.push_str(name);
    out.push(';');
    for (i, p) in params.iter().enumerate() {
        if i > 0 {
            out.push(';');
        }
        push_type(&mut out, p);
    }
    out
}

/// Canonical signature of a constructor.
pub fn ctor_signature(params: &[TypeRef]) -> String {
    signature(CTOR_NAME, params)
}

fn push_type(out: &mut String, ty: &TypeRef) {
    use std::fmt::Write;
    // Display already produces the canonical name (`int`,
    // `java.lang.String`, `java.lang.Object[]`).
    let _ = write!(out, "{ty}");
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_vm::Prim;

    #[test]
    fn test_method_signature() {
        let sig = signature(
            "set",
            &[TypeRef::object("java.lang.String"), TypeRef::Prim(Prim::Int)],
        );
        assert_eq!(sig, "set;java.lang.String;int");
    }

    #[test]
    fn test_no_parameter_signature_keeps_delimiter() {
        assert_eq!(signature("get", &[]), "get;");
    }

    #[test]
    fn test_ctor_signature() {
        let sig = ctor_signature(&[TypeRef::object("java.lang.String"), TypeRef::int()]);
        assert_eq!(sig, "<init>;java.lang.String;int");
        assert_eq!(ctor_signature(&[]), "<init>;");
    }
}
