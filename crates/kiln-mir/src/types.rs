//! MIR type system
//!
//! Types are interned structurally: the seven primitives are pre-interned at
//! fixed ids, pointer and function types are deduplicated by their structural
//! key. Equal keys always yield the same `TypeId`.

use rustc_hash::FxHashMap;

use crate::arena::{Arena, TypeId};

/// Structural content of an interned type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MirType {
    I8,
    I16,
    I32,
    I64,
    F32,
    F64,
    Void,
    /// Pointer to `elem` in the given address space.
    Ptr { elem: TypeId, addr_space: u32 },
    /// Function type: return type plus parameter types.
    Func { ret: TypeId, params: Vec<TypeId> },
}

impl MirType {
    pub fn is_integer(&self) -> bool {
        matches!(self, MirType::I8 | MirType::I16 | MirType::I32 | MirType::I64)
    }

    pub fn is_float(&self) -> bool {
        matches!(self, MirType::F32 | MirType::F64)
    }

    pub fn is_pointer(&self) -> bool {
        matches!(self, MirType::Ptr { .. })
    }

    pub fn is_void(&self) -> bool {
        matches!(self, MirType::Void)
    }

    /// MIR integers are all signed; the bit is meaningful only for integers.
    pub fn is_signed(&self) -> bool {
        self.is_integer()
    }

    pub fn is_32bits(&self) -> bool {
        matches!(self, MirType::I32 | MirType::F32)
    }

    pub fn is_64bits(&self) -> bool {
        matches!(self, MirType::I64 | MirType::F64)
    }

    /// Bit width of an integer type.
    pub fn bit_width(&self) -> u32 {
        match self {
            MirType::I8 => 8,
            MirType::I16 => 16,
            MirType::I32 => 32,
            MirType::I64 => 64,
            _ => panic!("bit_width on non-integer type"),
        }
    }

    /// Size in bytes; pointers are 8 bytes on both supported targets.
    pub fn num_bytes(&self) -> u32 {
        match self {
            MirType::I8 => 1,
            MirType::I16 => 2,
            MirType::I32 => 4,
            MirType::I64 | MirType::F64 => 8,
            MirType::F32 => 4,
            MirType::Void => 0,
            MirType::Ptr { .. } | MirType::Func { .. } => 8,
        }
    }
}

/// Deduplicating store of types for one compile context.
///
/// Not thread-safe; each compile thread owns its own interner.
#[derive(Debug)]
pub struct TypeInterner {
    arena: Arena<TypeId, MirType>,
    dedup: FxHashMap<MirType, TypeId>,
}

impl Default for TypeInterner {
    fn default() -> Self {
        TypeInterner::new()
    }
}

impl TypeInterner {
    pub const I8: TypeId = TypeId(0);
    pub const I16: TypeId = TypeId(1);
    pub const I32: TypeId = TypeId(2);
    pub const I64: TypeId = TypeId(3);
    pub const F32: TypeId = TypeId(4);
    pub const F64: TypeId = TypeId(5);
    pub const VOID: TypeId = TypeId(6);

    pub fn new() -> Self {
        let mut interner = TypeInterner {
            arena: Arena::new(),
            dedup: FxHashMap::default(),
        };
        for prim in [
            MirType::I8,
            MirType::I16,
            MirType::I32,
            MirType::I64,
            MirType::F32,
            MirType::F64,
            MirType::Void,
        ] {
            interner.intern(prim);
        }
        interner
    }

    /// Canonicalize a type: structurally equal keys return the same id.
    pub fn intern(&mut self, ty: MirType) -> TypeId {
        if let Some(&id) = self.dedup.get(&ty) {
            return id;
        }
        let id = self.arena.alloc(ty.clone());
        self.dedup.insert(ty, id);
        id
    }

    /// Intern a pointer to `elem` in address space 0.
    pub fn pointer_to(&mut self, elem: TypeId) -> TypeId {
        self.intern(MirType::Ptr { elem, addr_space: 0 })
    }

    /// Intern the `void*` type used for the instance pointer.
    pub fn void_ptr(&mut self) -> TypeId {
        self.pointer_to(Self::VOID)
    }

    /// Intern a function type.
    pub fn function(&mut self, ret: TypeId, params: Vec<TypeId>) -> TypeId {
        self.intern(MirType::Func { ret, params })
    }

    pub fn get(&self, id: TypeId) -> &MirType {
        self.arena.get(id)
    }

    /// Return type of a function type id.
    pub fn func_ret(&self, id: TypeId) -> TypeId {
        match self.get(id) {
            MirType::Func { ret, .. } => *ret,
            _ => panic!("func_ret on non-function type"),
        }
    }

    /// Parameter types of a function type id.
    pub fn func_params(&self, id: TypeId) -> &[TypeId] {
        match self.get(id) {
            MirType::Func { params, .. } => params,
            _ => panic!("func_params on non-function type"),
        }
    }

    pub fn len(&self) -> usize {
        self.arena.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arena.is_empty()
    }
}
