//! Native function signatures
//!
//! The compiler-side view of the runtime's native table: name, arity,
//! return type and an argument verifier the resolver runs against the
//! call's resolved argument types. The handlers themselves live in
//! `rill_runtime::natives`; both sides register the same fixed set.

use crate::types::{PrimitiveKind, TypeDesc};

type VerifierFn = fn(&[TypeDesc]) -> Result<(), String>;

pub struct BuiltinSignature {
    pub name: &'static str,
    pub arity: usize,
    pub return_type: fn() -> TypeDesc,
    pub verifier: VerifierFn,
}

const BUILTINS: [BuiltinSignature; 8] = [
    BuiltinSignature {
        name: "print",
        arity: 1,
        return_type: TypeDesc::null,
        verifier: verify_print,
    },
    BuiltinSignature {
        name: "int",
        arity: 1,
        return_type: TypeDesc::int,
        verifier: verify_scalar_convertible,
    },
    BuiltinSignature {
        name: "float",
        arity: 1,
        return_type: TypeDesc::float,
        verifier: verify_scalar_convertible,
    },
    BuiltinSignature {
        name: "string",
        arity: 1,
        return_type: TypeDesc::string,
        verifier: verify_stringifiable,
    },
    BuiltinSignature {
        name: "readline",
        arity: 1,
        return_type: TypeDesc::string,
        verifier: verify_readline,
    },
    BuiltinSignature {
        name: "size",
        arity: 1,
        return_type: TypeDesc::int,
        verifier: verify_size,
    },
    BuiltinSignature {
        name: "fill_trivial",
        arity: 2,
        return_type: TypeDesc::null,
        verifier: verify_fill_trivial,
    },
    BuiltinSignature {
        name: "%resize_list_trivial",
        arity: 2,
        return_type: TypeDesc::null,
        verifier: verify_resize_list_trivial,
    },
];

pub fn builtin_signature(name: &str) -> Option<&'static BuiltinSignature> {
    BUILTINS.iter().find(|signature| signature.name == name)
}

pub fn is_builtin(name: &str) -> bool {
    builtin_signature(name).is_some()
}

fn one_argument(arguments: &[TypeDesc]) -> Result<&TypeDesc, String> {
    if arguments.len() != 1 {
        return Err("arity incorrect, should be 1".to_string());
    }
    Ok(&arguments[0])
}

fn verify_print(arguments: &[TypeDesc]) -> Result<(), String> {
    let argument = one_argument(arguments)?;
    match argument {
        TypeDesc::Primitive { .. } | TypeDesc::List { .. } | TypeDesc::Tuple { .. } => Ok(()),
        _ => Err("incorrect argument type".to_string()),
    }
}

fn verify_scalar_convertible(arguments: &[TypeDesc]) -> Result<(), String> {
    let argument = one_argument(arguments)?;
    match argument.primitive_kind() {
        Some(
            PrimitiveKind::Int | PrimitiveKind::Float | PrimitiveKind::String | PrimitiveKind::Bool,
        ) => Ok(()),
        _ => Err("incorrect argument type".to_string()),
    }
}

fn verify_stringifiable(arguments: &[TypeDesc]) -> Result<(), String> {
    let argument = one_argument(arguments)?;
    if argument.is_list() || argument.is_tuple() {
        return Ok(());
    }
    match argument.primitive_kind() {
        Some(
            PrimitiveKind::Int | PrimitiveKind::Float | PrimitiveKind::String | PrimitiveKind::Bool,
        ) => Ok(()),
        _ => Err("incorrect argument type".to_string()),
    }
}

fn verify_readline(arguments: &[TypeDesc]) -> Result<(), String> {
    let argument = one_argument(arguments)?;
    if argument.is_string() {
        Ok(())
    } else {
        Err("incorrect argument type, can only pass string as prompt".to_string())
    }
}

fn verify_size(arguments: &[TypeDesc]) -> Result<(), String> {
    let argument = one_argument(arguments)?;
    if argument.is_list() || argument.is_tuple() || argument.is_string() {
        Ok(())
    } else {
        Err("incorrect argument type, can only be list, string or tuple".to_string())
    }
}

fn verify_fill_trivial(arguments: &[TypeDesc]) -> Result<(), String> {
    if arguments.len() != 2 {
        return Err("arity incorrect, should be 2".to_string());
    }
    let contained = match &arguments[0] {
        TypeDesc::List { contained, .. } => contained,
        _ => return Err("type of the first argument has to be a list type".to_string()),
    };
    if contained.is_ref() {
        return Err("cannot fill list of references".to_string());
    }
    if !contained.is_trivial() || !arguments[1].is_trivial() {
        return Err("cannot call function with arguments having non-trivial types".to_string());
    }
    if !contained.matches(&arguments[1]) {
        return Err("type of value must match contained type of list".to_string());
    }
    Ok(())
}

fn verify_resize_list_trivial(arguments: &[TypeDesc]) -> Result<(), String> {
    // Not user-callable; the resolver only produces well-formed calls
    if arguments.len() != 2 || !arguments[0].is_list() || !arguments[1].is_int() {
        return Err("incorrect argument types".to_string());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list_of(element: TypeDesc) -> TypeDesc {
        TypeDesc::List {
            contained: Box::new(element),
            is_const: false,
            is_ref: false,
        }
    }

    #[test]
    fn test_lookup() {
        assert!(is_builtin("print"));
        assert!(is_builtin("%resize_list_trivial"));
        assert!(!is_builtin("println"));
    }

    #[test]
    fn test_print_accepts_lists() {
        let signature = builtin_signature("print").unwrap();
        assert!((signature.verifier)(&[list_of(TypeDesc::int())]).is_ok());
        assert!((signature.verifier)(&[]).is_err());
    }

    #[test]
    fn test_readline_requires_string_prompt() {
        let signature = builtin_signature("readline").unwrap();
        assert!((signature.verifier)(&[TypeDesc::string()]).is_ok());
        assert!((signature.verifier)(&[TypeDesc::int()]).is_err());
    }

    #[test]
    fn test_fill_trivial_rejects_string_lists() {
        let signature = builtin_signature("fill_trivial").unwrap();
        assert!((signature.verifier)(&[list_of(TypeDesc::int()), TypeDesc::int()]).is_ok());
        assert!(
            (signature.verifier)(&[list_of(TypeDesc::string()), TypeDesc::string()]).is_err()
        );
        assert!((signature.verifier)(&[list_of(TypeDesc::int()), TypeDesc::float()]).is_err());
    }
}
