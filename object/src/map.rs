use crate::map_word::MapWord;
use crate::objects::InstanceType;
use crate::Value;

/// Instance-size sentinel for types whose size is computed from the
/// object's own length fields.
pub const VARIABLE_SIZE: u32 = 0;

/// A type descriptor.
///
/// Every heap object's first word points at a `Map`, which supplies the
/// instance type and enough layout information to compute the object's
/// size and walk its body. Maps live in the map space and describe each
/// other; the map of all maps (the meta map) describes itself.
///
/// Layout in memory:
/// ```text
/// [map word 8B] [instance_type: u16, pad: u16, instance_size: u32] [code_cache: Value 8B]
/// ```
#[repr(C)]
pub struct Map {
    pub map_word: MapWord,
    instance_type: u16,
    _unused: u16,
    instance_size: u32,
    /// Cache of recently dispatched code for instances of this map, or
    /// fixnum 0 when empty. Flushed during marking when
    /// `cleanup_caches_in_maps_at_gc` is set.
    code_cache: Value,
}

impl Map {
    pub const SIZE: usize = size_of::<Map>();
    /// Byte offset of the code-cache slot, the map's only pointer field.
    pub const CODE_CACHE_OFFSET: usize = 16;

    #[inline(always)]
    pub fn instance_type(&self) -> InstanceType {
        InstanceType::from_u16(self.instance_type)
    }

    /// Instance size in bytes, or [`VARIABLE_SIZE`].
    #[inline(always)]
    pub fn instance_size(&self) -> u32 {
        self.instance_size
    }

    #[inline(always)]
    pub fn code_cache(&self) -> Value {
        self.code_cache
    }

    #[inline(always)]
    pub fn set_code_cache(&mut self, cache: Value) {
        self.code_cache = cache;
    }

    #[inline(always)]
    pub fn clear_code_cache(&mut self) {
        self.code_cache = Value::from_i64(0);
    }
}

const _: () = assert!(Map::SIZE == 24);
const _: () = assert!(Map::SIZE % size_of::<usize>() == 0);

impl core::fmt::Debug for Map {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Map")
            .field("map_word", &self.map_word)
            .field("instance_type", &self.instance_type())
            .field("instance_size", &self.instance_size)
            .finish()
    }
}

/// Initialize a map at a raw map-space allocation.
///
/// # Safety
///
/// `ptr` must point to at least [`Map::SIZE`] bytes of writable memory,
/// and `meta_map` must be the address this space uses for the map of
/// maps (for the meta map itself, its own address).
pub unsafe fn init_map(
    ptr: *mut Map,
    meta_map: usize,
    instance_type: InstanceType,
    instance_size: u32,
) {
    // SAFETY: ptr is valid for Map::SIZE bytes by contract
    unsafe {
        ptr.write(Map {
            map_word: MapWord::from_map_address(meta_map),
            instance_type: instance_type as u16,
            _unused: 0,
            instance_size,
            code_cache: Value::from_i64(0),
        });
    }
}
