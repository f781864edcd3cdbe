// Device channel capability and the game's memory contract.
//
// The device is whatever sits between this client and the running game
// (an emulator bridge, a flash cart over USB). The engine only needs three
// operations from it, expressed as the object-safe `DeviceChannel` trait:
// read a byte range, write a byte range, and read the loaded program's
// signature block. Transport details are the implementor's business.
//
// The memory contract with the game:
// - `GAME_MODE` (1 byte): current game module. Items may only be written in
//   one of `IN_GAME_MODES`.
// - `ROM_SIGNATURE` (0x15 bytes): ASCII signature of the loaded seed, padded
//   with 0x00/0xFF; all 0xFF means no ROM.
// - `PENDING_ITEM` (4 bytes): `[seq_hi, seq_lo, item_id, from_player]`. The
//   game consumes the item by zeroing `item_id`, and the first two bytes then
//   hold the sequence key of the last item it took, which makes the device
//   the source of truth for the delivery cursor.
// - `SNAPSHOT_REGIONS`: progress tables mirrored to the relay.
//
// `TimedDevice` wraps any channel and bounds every call with
// `tokio::time::timeout`, so a bridge that stops answering turns into
// `DeviceError::Timeout` instead of a stalled session.
//
// `MemoryDevice` is an in-process implementation backed by a sparse byte
// map. Tests script it directly; the CLI uses it for `--simulate-signature`.
// With auto-consume on, it behaves like a game that takes every item the
// instant it is written.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use multiworld_protocol::{ItemEvent, MemorySnapshot, SequenceKey};

use crate::error::DeviceError;

/// A fixed-size named range of device memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryRegion {
    pub name: &'static str,
    pub address: u32,
    pub size: usize,
}

impl MemoryRegion {
    pub const fn new(name: &'static str, address: u32, size: usize) -> Self {
        Self {
            name,
            address,
            size,
        }
    }
}

pub const GAME_MODE: MemoryRegion = MemoryRegion::new("game_mode", 0xF5_0010, 1);
pub const ROM_SIGNATURE: MemoryRegion = MemoryRegion::new("rom_name", 0xE0_2000, 0x15);
pub const PENDING_ITEM: MemoryRegion = MemoryRegion::new("pending_item", 0xF5_F4D0, 4);

pub const POTS: MemoryRegion = MemoryRegion::new("pots", 0xF6_6018, 0x250);
pub const SPRITES: MemoryRegion = MemoryRegion::new("sprites", 0xF6_6268, 0x250);

/// Regions mirrored to the relay with `update_memory`.
pub const SNAPSHOT_REGIONS: [MemoryRegion; 8] = [
    GAME_MODE,
    MemoryRegion::new("base", 0xF5_F000, 0x256),
    MemoryRegion::new("overworld", 0xF5_F280, 0x82),
    MemoryRegion::new("npcs", 0xF5_F410, 2),
    MemoryRegion::new("misc", 0xF5_F3C6, 4),
    POTS,
    SPRITES,
    MemoryRegion::new("shops", 0xF6_64B8, 0x29),
];

/// Game modules in which the game polls the pending-item slot.
pub const IN_GAME_MODES: [u8; 3] = [0x07, 0x09, 0x0B];
/// Title screen, file select, and the save-and-quit module.
const MENU_MODES: [u8; 7] = [0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x17];

/// Snapshot regions after applying the skip flags.
pub fn snapshot_regions(skip_pots: bool, skip_sprites: bool) -> Vec<MemoryRegion> {
    SNAPSHOT_REGIONS
        .into_iter()
        .filter(|r| !(skip_pots && *r == POTS) && !(skip_sprites && *r == SPRITES))
        .collect()
}

/// The game module byte.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GameMode(pub u8);

impl GameMode {
    pub fn is_in_game(self) -> bool {
        IN_GAME_MODES.contains(&self.0)
    }

    /// Title, file select, or quitting: the player has left the game.
    pub fn is_save_and_quit(self) -> bool {
        MENU_MODES.contains(&self.0)
    }
}

/// Decoded `PENDING_ITEM` contents.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PendingSlot {
    /// Sequence key of the last item the game took (or is about to take).
    pub last_delivered: SequenceKey,
    pub item_id: u8,
    pub from_player: u8,
}

impl PendingSlot {
    pub fn from_bytes(bytes: [u8; 4]) -> Self {
        Self {
            last_delivered: SequenceKey::new(bytes[0], bytes[1]),
            item_id: bytes[2],
            from_player: bytes[3],
        }
    }

    /// Whether the game has taken the previous item.
    pub fn is_empty(&self) -> bool {
        self.item_id == 0
    }
}

/// Slot bytes that hand `item` to the game.
pub fn encode_delivery(item: &ItemEvent) -> [u8; 4] {
    [
        item.sequence.hi(),
        item.sequence.lo(),
        item.item_id,
        item.from_player.as_device_byte(),
    ]
}

/// Read/write access to the game's memory.
#[async_trait]
pub trait DeviceChannel: Send + Sync {
    async fn read_range(&self, address: u32, size: usize) -> Result<Vec<u8>, DeviceError>;

    async fn write_range(&self, address: u32, data: &[u8]) -> Result<(), DeviceError>;

    /// Raw signature block of the loaded program.
    async fn detect_identity(&self) -> Result<Vec<u8>, DeviceError> {
        read_region(self, ROM_SIGNATURE).await
    }
}

/// Read a region, failing on a short read.
pub async fn read_region<D>(device: &D, region: MemoryRegion) -> Result<Vec<u8>, DeviceError>
where
    D: DeviceChannel + ?Sized,
{
    let bytes = device.read_range(region.address, region.size).await?;
    if bytes.len() < region.size {
        return Err(DeviceError::ShortRead {
            address: region.address,
            expected: region.size,
            actual: bytes.len(),
        });
    }
    Ok(bytes)
}

pub async fn read_game_mode(device: &dyn DeviceChannel) -> Result<GameMode, DeviceError> {
    let bytes = read_region(device, GAME_MODE).await?;
    Ok(GameMode(bytes[0]))
}

pub async fn read_pending_slot(device: &dyn DeviceChannel) -> Result<PendingSlot, DeviceError> {
    let bytes = read_region(device, PENDING_ITEM).await?;
    Ok(PendingSlot::from_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3],
    ]))
}

pub async fn read_snapshot(
    device: &dyn DeviceChannel,
    regions: &[MemoryRegion],
) -> Result<MemorySnapshot, DeviceError> {
    let mut snapshot = MemorySnapshot::new();
    for region in regions {
        let mut bytes = read_region(device, *region).await?;
        bytes.truncate(region.size);
        snapshot.insert(region.name.to_owned(), bytes);
    }
    Ok(snapshot)
}

/// A device channel whose every call gives up after `limit`.
pub struct TimedDevice {
    inner: Arc<dyn DeviceChannel>,
    limit: Duration,
}

impl TimedDevice {
    pub fn wrap(inner: Arc<dyn DeviceChannel>, limit: Duration) -> Arc<dyn DeviceChannel> {
        Arc::new(Self { inner, limit })
    }

    async fn bounded<T>(
        &self,
        call: impl Future<Output = Result<T, DeviceError>>,
    ) -> Result<T, DeviceError> {
        tokio::time::timeout(self.limit, call)
            .await
            .map_err(|_| DeviceError::Timeout(self.limit))?
    }
}

#[async_trait]
impl DeviceChannel for TimedDevice {
    async fn read_range(&self, address: u32, size: usize) -> Result<Vec<u8>, DeviceError> {
        self.bounded(self.inner.read_range(address, size)).await
    }

    async fn write_range(&self, address: u32, data: &[u8]) -> Result<(), DeviceError> {
        self.bounded(self.inner.write_range(address, data)).await
    }

    async fn detect_identity(&self) -> Result<Vec<u8>, DeviceError> {
        self.bounded(self.inner.detect_identity()).await
    }
}

/// A write recorded by `MemoryDevice`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceWrite {
    pub address: u32,
    pub data: Vec<u8>,
}

#[derive(Debug)]
struct MemoryInner {
    bytes: HashMap<u32, u8>,
    attached: bool,
    auto_consume: bool,
    writes: Vec<DeviceWrite>,
    reads: usize,
}

/// In-memory device. Unwritten addresses read as zero.
#[derive(Debug)]
pub struct MemoryDevice {
    inner: Mutex<MemoryInner>,
}

impl Default for MemoryDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDevice {
    /// An attached device with no ROM loaded.
    pub fn new() -> Self {
        let device = Self {
            inner: Mutex::new(MemoryInner {
                bytes: HashMap::new(),
                attached: true,
                auto_consume: false,
                writes: Vec::new(),
                reads: 0,
            }),
        };
        device.clear_signature();
        device
    }

    /// An attached device running `signature`, sitting in-game.
    pub fn with_signature(signature: &str) -> Self {
        let device = Self::new();
        device.set_signature(signature);
        device.set_game_mode(IN_GAME_MODES[0]);
        device
    }

    fn lock(&self) -> MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Overwrite memory without recording a write.
    pub fn poke(&self, address: u32, data: &[u8]) {
        let mut inner = self.lock();
        for (addr, byte) in (address..).zip(data) {
            inner.bytes.insert(addr, *byte);
        }
    }

    pub fn peek(&self, address: u32, size: usize) -> Vec<u8> {
        let inner = self.lock();
        (address..)
            .take(size)
            .map(|addr| inner.bytes.get(&addr).copied().unwrap_or(0))
            .collect()
    }

    /// Load a signature, zero-padded to the block size.
    pub fn set_signature(&self, signature: &str) {
        let mut block = vec![0u8; ROM_SIGNATURE.size];
        for (dst, src) in block.iter_mut().zip(signature.bytes()) {
            *dst = src;
        }
        self.poke(ROM_SIGNATURE.address, &block);
    }

    pub fn clear_signature(&self) {
        self.poke(ROM_SIGNATURE.address, &[0xFF; ROM_SIGNATURE.size]);
    }

    pub fn set_game_mode(&self, mode: u8) {
        self.poke(GAME_MODE.address, &[mode]);
    }

    /// Detach or reattach. While detached every operation fails with
    /// `DeviceError::NoDevice`.
    pub fn set_attached(&self, attached: bool) {
        self.lock().attached = attached;
    }

    pub fn set_auto_consume(&self, auto_consume: bool) {
        self.lock().auto_consume = auto_consume;
    }

    /// Set the last-delivered key with an empty slot.
    pub fn set_cursor(&self, key: SequenceKey) {
        self.poke(PENDING_ITEM.address, &[key.hi(), key.lo(), 0, 0]);
    }

    pub fn pending_slot(&self) -> PendingSlot {
        let bytes = self.peek(PENDING_ITEM.address, PENDING_ITEM.size);
        PendingSlot::from_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
    }

    /// Act like the game taking the pending item. Returns it, if there was one.
    pub fn consume_pending(&self) -> Option<PendingSlot> {
        let slot = self.pending_slot();
        if slot.is_empty() {
            return None;
        }
        self.poke(PENDING_ITEM.address + 2, &[0]);
        Some(slot)
    }

    pub fn writes(&self) -> Vec<DeviceWrite> {
        self.lock().writes.clone()
    }

    /// Every item handed to the game, in write order.
    pub fn delivered(&self) -> Vec<PendingSlot> {
        self.lock()
            .writes
            .iter()
            .filter(|w| w.address == PENDING_ITEM.address && w.data.len() == PENDING_ITEM.size)
            .map(|w| PendingSlot::from_bytes([w.data[0], w.data[1], w.data[2], w.data[3]]))
            .collect()
    }

    pub fn read_count(&self) -> usize {
        self.lock().reads
    }
}

#[async_trait]
impl DeviceChannel for MemoryDevice {
    async fn read_range(&self, address: u32, size: usize) -> Result<Vec<u8>, DeviceError> {
        let mut inner = self.lock();
        if !inner.attached {
            return Err(DeviceError::NoDevice);
        }
        inner.reads += 1;
        Ok((address..)
            .take(size)
            .map(|addr| inner.bytes.get(&addr).copied().unwrap_or(0))
            .collect())
    }

    async fn write_range(&self, address: u32, data: &[u8]) -> Result<(), DeviceError> {
        let mut inner = self.lock();
        if !inner.attached {
            return Err(DeviceError::NoDevice);
        }
        for (addr, byte) in (address..).zip(data) {
            inner.bytes.insert(addr, *byte);
        }
        inner.writes.push(DeviceWrite {
            address,
            data: data.to_vec(),
        });
        if inner.auto_consume && address == PENDING_ITEM.address {
            inner.bytes.insert(PENDING_ITEM.address + 2, 0);
        }
        Ok(())
    }
}
