//! Abstract stack frame
//!
//! Stack objects are created by the allocator (spill slots), the prolog
//! pass (callee-save slots), and lowering (fixed incoming-argument slots).
//! Offsets are assigned during frame finalization; until then objects are
//! referenced through `FrameIndex` operands.

/// What a stack object holds; fixed objects carry their offset up front.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackObjectKind {
    /// Incoming stack argument at a fixed FP-relative offset.
    Fixed(i64),
    /// Spill slot for a callee-saved register.
    CalleeSave,
    /// Spill slot or local scratch.
    Local,
}

#[derive(Debug, Clone)]
pub struct StackObject {
    pub size: u32,
    pub align: u32,
    pub kind: StackObjectKind,
    /// FP-relative offset, assigned by frame finalization.
    pub offset: Option<i64>,
}

/// Frame bookkeeping for one function.
#[derive(Debug, Clone, Default)]
pub struct FrameInfo {
    objects: Vec<StackObject>,
    /// Largest outgoing call-argument area, in bytes.
    pub max_call_frame_size: u32,
    /// Whether any call adjusts SP (erased call-frame pseudos seen).
    pub adjusts_sp: bool,
    /// Total frame size after finalization, rounded to stack alignment.
    pub stack_size: u32,
}

impl FrameInfo {
    pub const STACK_ALIGN: u32 = 16;

    pub fn new() -> Self {
        FrameInfo::default()
    }

    /// Create a stack object and return its frame index.
    pub fn create_object(&mut self, size: u32, align: u32, kind: StackObjectKind) -> u32 {
        let index = self.objects.len() as u32;
        let offset = match kind {
            StackObjectKind::Fixed(off) => Some(off),
            _ => None,
        };
        self.objects.push(StackObject {
            size,
            align,
            kind,
            offset,
        });
        index
    }

    pub fn object(&self, index: u32) -> &StackObject {
        &self.objects[index as usize]
    }

    pub fn object_mut(&mut self, index: u32) -> &mut StackObject {
        &mut self.objects[index as usize]
    }

    pub fn objects(&self) -> &[StackObject] {
        &self.objects
    }

    pub fn num_objects(&self) -> u32 {
        self.objects.len() as u32
    }

    pub fn set_object_offset(&mut self, index: u32, offset: i64) {
        self.objects[index as usize].offset = Some(offset);
    }
}
