//! Handles and the values they hold.
//!
//! A [Handle] is the address of a value slot inside a segment.
//! The slot holds an [ObjectRef] (or nothing), and the
//! [HandleType] of the block determines how the collector treats it.
use std::fmt::{self, Debug, Formatter};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicUsize, Ordering};

/// An opaque reference to a managed object.
///
/// The handle table never dereferences these,
/// it only stores them and hands them back to the collector.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ObjectRef(NonZeroUsize);
impl ObjectRef {
    #[inline]
    pub const fn from_addr(addr: usize) -> Option<ObjectRef> {
        match NonZeroUsize::new(addr) {
            Some(addr) => Some(ObjectRef(addr)),
            None => None,
        }
    }
    #[inline]
    pub fn from_ptr<T>(ptr: std::ptr::NonNull<T>) -> ObjectRef {
        ObjectRef(unsafe { NonZeroUsize::new_unchecked(ptr.as_ptr() as usize) })
    }
    #[inline]
    pub const fn addr(self) -> usize {
        self.0.get()
    }
}
impl Debug for ObjectRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectRef({:#x})", self.0)
    }
}

/// A handle to a value slot owned by a handle table.
///
/// Handles are plain addresses and are only meaningful
/// to the table that allocated them.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Handle(NonZeroUsize);
impl Handle {
    /// Reinterpret a raw address as a handle.
    ///
    /// This is safe, since every table operation validates
    /// the handle before touching memory.
    #[inline]
    pub const fn from_addr(addr: usize) -> Option<Handle> {
        match NonZeroUsize::new(addr) {
            Some(addr) => Some(Handle(addr)),
            None => None,
        }
    }
    /// ## Safety
    /// The address must be non-zero
    #[inline]
    pub(crate) const unsafe fn from_addr_unchecked(addr: usize) -> Handle {
        Handle(NonZeroUsize::new_unchecked(addr))
    }
    #[inline]
    pub const fn addr(self) -> usize {
        self.0.get()
    }
}
impl Debug for Handle {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Handle({:#x})", self.0)
    }
}
impl slog::Value for Handle {
    fn serialize(
        &self,
        _record: &slog::Record,
        key: slog::Key,
        serializer: &mut dyn slog::Serializer,
    ) -> slog::Result {
        serializer.emit_arguments(key, &format_args!("{:#x}", self.0))
    }
}

/// The storage behind a handle.
///
/// Slots are atomic so concurrent scans can read them
/// while mutators update their handles.
#[repr(transparent)]
pub struct HandleSlot(AtomicUsize);
impl HandleSlot {
    #[inline]
    pub fn load(&self) -> Option<ObjectRef> {
        ObjectRef::from_addr(self.0.load(Ordering::Acquire))
    }
    #[inline]
    pub fn store(&self, value: Option<ObjectRef>) {
        self.0.store(value.map_or(0, ObjectRef::addr), Ordering::Release)
    }
    #[inline]
    pub fn swap(&self, value: Option<ObjectRef>) -> Option<ObjectRef> {
        ObjectRef::from_addr(self.0.swap(value.map_or(0, ObjectRef::addr), Ordering::AcqRel))
    }
    /// Replace the value if it is still `current`,
    /// returning the previous value either way.
    #[inline]
    pub fn compare_exchange(
        &self,
        current: Option<ObjectRef>,
        new: Option<ObjectRef>,
    ) -> Result<Option<ObjectRef>, Option<ObjectRef>> {
        self.0
            .compare_exchange(
                current.map_or(0, ObjectRef::addr),
                new.map_or(0, ObjectRef::addr),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map(ObjectRef::from_addr)
            .map_err(ObjectRef::from_addr)
    }
    #[inline]
    pub fn is_null(&self) -> bool {
        self.0.load(Ordering::Acquire) == 0
    }
}
impl Debug for HandleSlot {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_tuple("HandleSlot").field(&self.load()).finish()
    }
}

/// The kind of a handle, which determines how collections treat it
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[cfg_attr(feature = "serde1", derive(serde::Serialize, serde::Deserialize))]
pub enum HandleType {
    /// Cleared as soon as the referent is found unreachable,
    /// before finalization.
    WeakShort,
    /// Cleared only after finalization has run.
    WeakLong,
    /// Keeps its referent alive.
    Strong,
    /// Keeps its referent alive and prevents it from moving.
    Pinned,
    /// Keeps its secondary alive for as long as its primary is alive.
    ///
    /// The primary is the handle's value and the secondary
    /// lives in the handle's user-data slot.
    Dependent,
}
impl HandleType {
    /// The number of public handle types
    pub const COUNT: usize = 5;
    pub const ALL: [HandleType; HandleType::COUNT] = [
        HandleType::WeakShort,
        HandleType::WeakLong,
        HandleType::Strong,
        HandleType::Pinned,
        HandleType::Dependent,
    ];
    /// Whether handles of this type carry a paired user-data slot
    #[inline]
    pub const fn has_user_data(self) -> bool {
        matches!(self, HandleType::Dependent)
    }
    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }
    /// Whether the collector should keep the referent alive
    #[inline]
    pub const fn is_strong(self) -> bool {
        matches!(self, HandleType::Strong | HandleType::Pinned)
    }
}

/// What a block is being used for.
///
/// This is [HandleType] plus the internal data-block kind,
/// which holds user data on behalf of another block
/// and is never handed out to callers.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum BlockTag {
    Handles(HandleType),
    UserData,
}
impl BlockTag {
    /// The number of distinct chains in a segment
    pub const COUNT: usize = HandleType::COUNT + 1;
    /// The index of this tag's allocation chain
    #[inline]
    pub const fn chain(self) -> usize {
        match self {
            BlockTag::Handles(ty) => ty.index(),
            BlockTag::UserData => HandleType::COUNT,
        }
    }
    #[inline]
    pub fn from_chain(chain: usize) -> BlockTag {
        if chain == HandleType::COUNT {
            BlockTag::UserData
        } else {
            BlockTag::Handles(HandleType::ALL[chain])
        }
    }
    #[inline]
    pub const fn handle_type(self) -> Option<HandleType> {
        match self {
            BlockTag::Handles(ty) => Some(ty),
            BlockTag::UserData => None,
        }
    }
}
impl From<HandleType> for BlockTag {
    #[inline]
    fn from(ty: HandleType) -> BlockTag {
        BlockTag::Handles(ty)
    }
}
