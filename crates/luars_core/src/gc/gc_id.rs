// ============ Object IDs ============
// Every heap object is addressed by a generational handle into the arena.
// A handle whose slot was freed (or freed and reused) resolves to nothing.

/// Generational index of an arena slot
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default, PartialOrd, Ord)]
pub struct GcRef {
    pub index: u32,
    pub generation: u32,
}

impl GcRef {
    #[inline(always)]
    pub const fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    /// Stable per-object hash input, the analogue of hashing an address.
    #[inline(always)]
    pub fn addr_hash(self) -> u32 {
        self.index ^ self.generation.rotate_left(16)
    }
}

macro_rules! typed_id {
    ($name:ident) => {
        #[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
        #[repr(transparent)]
        pub struct $name(pub GcRef);

        impl $name {
            #[inline(always)]
            pub fn gc_ref(self) -> GcRef {
                self.0
            }
        }
    };
}

typed_id!(StringId);
typed_id!(TableId);
typed_id!(FunctionId);
typed_id!(UpvalueId);
typed_id!(UserdataId);
typed_id!(ThreadId);

/// Object type tags
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcType {
    String = 0,
    Table = 1,
    Function = 2,
    Upvalue = 3,
    Thread = 4,
    Userdata = 5,
}

/// Unified GC object identifier
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum GcId {
    StringId(StringId),
    TableId(TableId),
    FunctionId(FunctionId),
    UpvalueId(UpvalueId),
    ThreadId(ThreadId),
    UserdataId(UserdataId),
}

impl GcId {
    #[inline(always)]
    pub fn gc_type(self) -> GcType {
        match self {
            GcId::StringId(_) => GcType::String,
            GcId::TableId(_) => GcType::Table,
            GcId::FunctionId(_) => GcType::Function,
            GcId::UpvalueId(_) => GcType::Upvalue,
            GcId::ThreadId(_) => GcType::Thread,
            GcId::UserdataId(_) => GcType::Userdata,
        }
    }

    #[inline(always)]
    pub fn gc_ref(self) -> GcRef {
        match self {
            GcId::StringId(StringId(r)) => r,
            GcId::TableId(TableId(r)) => r,
            GcId::FunctionId(FunctionId(r)) => r,
            GcId::UpvalueId(UpvalueId(r)) => r,
            GcId::ThreadId(ThreadId(r)) => r,
            GcId::UserdataId(UserdataId(r)) => r,
        }
    }

    #[inline(always)]
    pub fn index(self) -> u32 {
        self.gc_ref().index
    }
}

impl From<StringId> for GcId {
    fn from(id: StringId) -> Self {
        GcId::StringId(id)
    }
}

impl From<TableId> for GcId {
    fn from(id: TableId) -> Self {
        GcId::TableId(id)
    }
}

impl From<FunctionId> for GcId {
    fn from(id: FunctionId) -> Self {
        GcId::FunctionId(id)
    }
}

impl From<UpvalueId> for GcId {
    fn from(id: UpvalueId) -> Self {
        GcId::UpvalueId(id)
    }
}

impl From<ThreadId> for GcId {
    fn from(id: ThreadId) -> Self {
        GcId::ThreadId(id)
    }
}

impl From<UserdataId> for GcId {
    fn from(id: UserdataId) -> Self {
        GcId::UserdataId(id)
    }
}
