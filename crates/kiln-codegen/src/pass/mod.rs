//! Machine passes
//!
//! Run in order: register-class info, linear-scan register allocation,
//! prolog/epilog insertion with frame finalization, then peephole.

pub mod peephole;
pub mod prolog_epilog;
pub mod reg_class_info;
pub mod regalloc;
