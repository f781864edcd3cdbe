// Identity detection: which player and seed the device is running.
//
// Split in two so the device I/O can run in a cancellable task while the
// decision logic stays in the coordinator:
// - `DeviceSampler` (cheap to clone) reads the game mode, the signature
//   block, the pending-item cursor, and, when in-game, a memory snapshot.
//   It never writes, it bails out with `Sample::Skipped` whenever the
//   receiving flag is set, and each read is bounded by the device timeout.
// - `IdentityMonitor` is a pure state machine over samples. It remembers
//   what it resolved and decides whether a sample resolves an identity,
//   means the loaded game changed (reconnect), means we should join as a
//   non-player, or means the player just saved and quit.
//
// Signature format: `PP_<field>_<player>[_...]`, ASCII, padded with 0x00
// or 0xFF. `PP` must be one of the configured two-letter prefixes and the
// third underscore-delimited field is the player slot.

use std::sync::Arc;
use std::time::Duration;

use multiworld_protocol::{MemorySnapshot, PlayerSlot, SequenceKey};
use tracing::{debug, info};

use crate::device::{
    DeviceChannel, GameMode, MemoryRegion, TimedDevice, read_game_mode, read_pending_slot,
    read_snapshot,
};
use crate::error::DeviceError;
use crate::state::{DeviceStatus, PlayerIdentity, PlayerType, ReceivingFlag};

/// A parsed, compatible signature.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Signature {
    pub raw: String,
    pub prefix: String,
    pub player: PlayerSlot,
}

/// Result of reading the signature block.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SignatureRead {
    /// No program loaded (block all 0xFF or all zero).
    Absent,
    /// Something is loaded but this client cannot deliver into it.
    Incompatible(String),
    Compatible(Signature),
}

impl Signature {
    pub fn parse(block: &[u8], prefixes: &[String]) -> SignatureRead {
        if block.iter().all(|b| *b == 0xFF) || block.iter().all(|b| *b == 0) {
            return SignatureRead::Absent;
        }
        let end = block
            .iter()
            .position(|b| *b == 0 || *b == 0xFF)
            .unwrap_or(block.len());
        let Ok(text) = std::str::from_utf8(&block[..end]) else {
            return SignatureRead::Incompatible(String::from_utf8_lossy(&block[..end]).into_owned());
        };
        let text = text.trim();
        let incompatible = || SignatureRead::Incompatible(text.to_owned());

        let fields: Vec<&str> = text.split('_').collect();
        if fields.len() < 3 {
            return incompatible();
        }
        if !prefixes.iter().any(|p| p == fields[0]) {
            return incompatible();
        }
        match fields[2].parse::<i32>() {
            Ok(n) if n >= 1 => SignatureRead::Compatible(Signature {
                raw: text.to_owned(),
                prefix: fields[0].to_owned(),
                player: PlayerSlot(n),
            }),
            _ => incompatible(),
        }
    }
}

/// What one poll saw.
#[derive(Clone, Debug, PartialEq)]
pub enum Sample {
    /// The delivery loop owns the device.
    Skipped,
    Unavailable(String),
    Observed(Observation),
}

#[derive(Clone, Debug, PartialEq)]
pub struct Observation {
    pub mode: GameMode,
    pub signature: SignatureRead,
    pub cursor: SequenceKey,
    pub snapshot: Option<MemorySnapshot>,
}

/// Read-only device poller.
#[derive(Clone)]
pub struct DeviceSampler {
    device: Arc<dyn DeviceChannel>,
    receiving: ReceivingFlag,
    prefixes: Vec<String>,
    regions: Vec<MemoryRegion>,
}

impl DeviceSampler {
    pub fn new(
        device: Arc<dyn DeviceChannel>,
        receiving: ReceivingFlag,
        prefixes: Vec<String>,
        regions: Vec<MemoryRegion>,
        device_timeout: Duration,
    ) -> Self {
        Self {
            device: TimedDevice::wrap(device, device_timeout),
            receiving,
            prefixes,
            regions,
        }
    }

    pub async fn sample(&self) -> Sample {
        match self.try_sample().await {
            Ok(Some(observation)) => Sample::Observed(observation),
            Ok(None) => Sample::Skipped,
            Err(e) => Sample::Unavailable(e.to_string()),
        }
    }

    /// `Ok(None)` when receiving was set before or between reads.
    async fn try_sample(&self) -> Result<Option<Observation>, DeviceError> {
        let device = &*self.device;
        if self.receiving.is_set() {
            return Ok(None);
        }
        let mode = read_game_mode(device).await?;
        if self.receiving.is_set() {
            return Ok(None);
        }
        let signature = Signature::parse(&device.detect_identity().await?, &self.prefixes);
        if self.receiving.is_set() {
            return Ok(None);
        }
        let cursor = read_pending_slot(device).await?.last_delivered;
        let snapshot = if mode.is_in_game() && !self.receiving.is_set() {
            Some(read_snapshot(device, &self.regions).await?)
        } else {
            None
        };
        Ok(Some(Observation {
            mode,
            signature,
            cursor,
            snapshot,
        }))
    }
}

/// What the coordinator should do about identity after a sample.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IdentityChange {
    None,
    Resolved(PlayerIdentity),
    /// The loaded game is not the one we identified as; reconnect.
    Changed { previous: String },
    NonPlayer,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Decision {
    pub device: DeviceStatus,
    pub identity: IdentityChange,
    /// The player left the game for the menus since the last sample.
    pub save_and_quit: bool,
    pub cursor: Option<SequenceKey>,
    pub snapshot: Option<MemorySnapshot>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Resolved {
    Signature(String),
    NonPlayer,
}

/// Identity state machine over device samples.
#[derive(Debug, Default)]
pub struct IdentityMonitor {
    resolved: Option<Resolved>,
    last_mode: Option<GameMode>,
}

impl IdentityMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget the resolved identity (after a reconnect).
    pub fn reset(&mut self) {
        self.resolved = None;
    }

    /// Evaluate a sample. `may_join_as_non_player` is true when a user
    /// account is configured.
    pub fn observe(
        &mut self,
        sample: Sample,
        current: &PlayerIdentity,
        may_join_as_non_player: bool,
    ) -> Option<Decision> {
        let observation = match sample {
            Sample::Skipped => return None,
            Sample::Unavailable(reason) => {
                debug!(%reason, "device unavailable");
                self.last_mode = None;
                let identity = self.fallback(current, may_join_as_non_player);
                return Some(Decision {
                    device: DeviceStatus::NoDevice,
                    identity,
                    save_and_quit: false,
                    cursor: None,
                    snapshot: None,
                });
            }
            Sample::Observed(observation) => observation,
        };

        let mode = observation.mode;
        let save_and_quit =
            self.last_mode.is_some_and(GameMode::is_in_game) && mode.is_save_and_quit();
        self.last_mode = Some(mode);

        let identity = match observation.signature {
            SignatureRead::Compatible(signature) => match self.resolved.clone() {
                None if !current.is_resolved() || current.player_type == PlayerType::Player => {
                    info!(
                        player = %signature.player,
                        rom = %signature.raw,
                        "identified loaded game"
                    );
                    self.resolved = Some(Resolved::Signature(signature.raw.clone()));
                    IdentityChange::Resolved(PlayerIdentity::player(
                        signature.player,
                        signature.raw,
                    ))
                }
                Some(Resolved::Signature(raw)) if raw == signature.raw => IdentityChange::None,
                Some(Resolved::Signature(previous)) => {
                    self.resolved = None;
                    IdentityChange::Changed { previous }
                }
                None | Some(Resolved::NonPlayer) => {
                    self.resolved = None;
                    IdentityChange::Changed {
                        previous: "non-player".to_owned(),
                    }
                }
            },
            SignatureRead::Incompatible(text) => match self.resolved.clone() {
                Some(Resolved::Signature(previous)) => {
                    debug!(found = %text, "incompatible signature replaced resolved game");
                    self.resolved = None;
                    IdentityChange::Changed { previous }
                }
                _ => self.fallback(current, may_join_as_non_player),
            },
            SignatureRead::Absent => match self.resolved {
                Some(_) => IdentityChange::None,
                None => self.fallback(current, may_join_as_non_player),
            },
        };

        Some(Decision {
            device: if mode.is_in_game() {
                DeviceStatus::InGame(mode.0)
            } else {
                DeviceStatus::NotInGame(mode.0)
            },
            identity,
            save_and_quit,
            cursor: Some(observation.cursor),
            snapshot: observation.snapshot,
        })
    }

    fn fallback(
        &mut self,
        current: &PlayerIdentity,
        may_join_as_non_player: bool,
    ) -> IdentityChange {
        if may_join_as_non_player && self.resolved.is_none() && !current.is_resolved() {
            info!("no compatible game; joining as non-player");
            self.resolved = Some(Resolved::NonPlayer);
            IdentityChange::NonPlayer
        } else {
            IdentityChange::None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{MemoryDevice, snapshot_regions};

    fn prefixes() -> Vec<String> {
        vec!["DR".into(), "ER".into()]
    }

    fn block(text: &str) -> Vec<u8> {
        let mut bytes = vec![0u8; 0x15];
        bytes[..text.len()].copy_from_slice(text.as_bytes());
        bytes
    }

    #[test]
    fn parses_player_from_third_field() {
        let read = Signature::parse(&block("DR_abcdef_3_1"), &prefixes());
        let SignatureRead::Compatible(sig) = read else {
            panic!("expected compatible, got {read:?}");
        };
        assert_eq!(sig.player, PlayerSlot(3));
        assert_eq!(sig.prefix, "DR");
        assert_eq!(sig.raw, "DR_abcdef_3_1");
    }

    #[test]
    fn rejects_unknown_prefix_and_bad_fields() {
        assert_eq!(
            Signature::parse(&block("ZZ_abc_1_1"), &prefixes()),
            SignatureRead::Incompatible("ZZ_abc_1_1".into())
        );
        assert!(matches!(
            Signature::parse(&block("DR_abc"), &prefixes()),
            SignatureRead::Incompatible(_)
        ));
        assert!(matches!(
            Signature::parse(&block("DR_abc_x_1"), &prefixes()),
            SignatureRead::Incompatible(_)
        ));
        assert_eq!(Signature::parse(&[0xFF; 0x15], &prefixes()), SignatureRead::Absent);
        assert_eq!(Signature::parse(&[0; 0x15], &prefixes()), SignatureRead::Absent);
    }

    fn observed(signature: SignatureRead, mode: u8) -> Sample {
        Sample::Observed(Observation {
            mode: GameMode(mode),
            signature,
            cursor: SequenceKey::ZERO,
            snapshot: None,
        })
    }

    fn compatible(raw: &str) -> SignatureRead {
        Signature::parse(&block(raw), &prefixes())
    }

    #[test]
    fn resolve_then_change_triggers_exactly_one_reconnect() {
        let mut monitor = IdentityMonitor::new();
        let mut identity = PlayerIdentity::unresolved();

        let d = monitor.observe(observed(compatible("DR_a_2_1"), 0x07), &identity, false);
        let IdentityChange::Resolved(resolved) = d.unwrap().identity else {
            panic!("expected resolution");
        };
        assert_eq!(resolved.player_id, PlayerSlot(2));
        identity = resolved;

        let d = monitor.observe(observed(compatible("DR_a_2_1"), 0x07), &identity, false);
        assert_eq!(d.unwrap().identity, IdentityChange::None);

        let d = monitor.observe(observed(compatible("DR_b_3_1"), 0x07), &identity, false);
        assert_eq!(
            d.unwrap().identity,
            IdentityChange::Changed {
                previous: "DR_a_2_1".into()
            }
        );

        // The coordinator reconnects and clears identity; B then resolves.
        monitor.reset();
        identity = PlayerIdentity::unresolved();
        let d = monitor.observe(observed(compatible("DR_b_3_1"), 0x07), &identity, false);
        assert!(matches!(
            d.unwrap().identity,
            IdentityChange::Resolved(ref id) if id.player_id == PlayerSlot(3)
        ));
    }

    #[test]
    fn non_player_only_with_an_account() {
        let identity = PlayerIdentity::unresolved();
        let mut monitor = IdentityMonitor::new();
        let d = monitor.observe(observed(SignatureRead::Absent, 0x00), &identity, false);
        assert_eq!(d.unwrap().identity, IdentityChange::None);

        let d = monitor.observe(Sample::Unavailable("no device".into()), &identity, true);
        let d = d.unwrap();
        assert_eq!(d.identity, IdentityChange::NonPlayer);
        assert_eq!(d.device, DeviceStatus::NoDevice);

        // A compatible game appearing later is an identity change.
        let d = monitor.observe(
            observed(compatible("ER_z_1_1"), 0x07),
            &PlayerIdentity::non_player(),
            true,
        );
        assert!(matches!(d.unwrap().identity, IdentityChange::Changed { .. }));
    }

    #[test]
    fn leaving_the_game_is_save_and_quit() {
        let identity = PlayerIdentity::unresolved();
        let mut monitor = IdentityMonitor::new();
        let d = monitor.observe(observed(SignatureRead::Absent, 0x00), &identity, false);
        assert!(!d.unwrap().save_and_quit);
        let d = monitor.observe(observed(SignatureRead::Absent, 0x07), &identity, false);
        assert!(!d.unwrap().save_and_quit);
        let d = monitor.observe(observed(SignatureRead::Absent, 0x17), &identity, false);
        assert!(d.unwrap().save_and_quit);
    }

    #[test]
    fn skipped_samples_decide_nothing() {
        let mut monitor = IdentityMonitor::new();
        assert!(monitor
            .observe(Sample::Skipped, &PlayerIdentity::unresolved(), true)
            .is_none());
    }

    #[tokio::test]
    async fn sampler_reads_nothing_while_receiving() {
        let device = Arc::new(MemoryDevice::with_signature("DR_a_2_1"));
        let receiving = ReceivingFlag::new();
        let sampler = DeviceSampler::new(
            device.clone(),
            receiving.clone(),
            prefixes(),
            snapshot_regions(false, false),
            Duration::from_secs(1),
        );

        let guard = receiving.try_acquire().unwrap();
        assert_eq!(sampler.sample().await, Sample::Skipped);
        assert_eq!(device.read_count(), 0);
        drop(guard);

        let Sample::Observed(observation) = sampler.sample().await else {
            panic!("expected an observation");
        };
        assert!(matches!(observation.signature, SignatureRead::Compatible(_)));
        let snapshot = observation.snapshot.unwrap();
        assert_eq!(snapshot["game_mode"], vec![0x07]);
        assert_eq!(snapshot["base"].len(), 0x256);
    }
}
