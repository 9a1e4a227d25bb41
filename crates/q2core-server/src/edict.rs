// edict.rs -- server entity records and the arena that owns them

use bitflags::bitflags;
use q2core_common::q_shared::{AreaType, PmoveState, Vec3, MAX_EDICTS, MAX_ENT_CLUSTERS};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Solid {
    /// no interaction with other objects
    #[default]
    Not,
    /// only touch when inside, after moving
    Trigger,
    /// touch on edge
    Bbox,
    /// bsp clip, touch on edge
    Bsp,
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct SvFlags: u32 {
        /// don't send entity to clients, even if it has effects
        const NOCLIENT    = 0x0000_0001;
        /// treat as CONTENTS_DEADMONSTER for collision
        const DEADMONSTER = 0x0000_0002;
        /// treat as CONTENTS_MONSTER for collision
        const MONSTER     = 0x0000_0004;
    }
}

/// Where a linked entity sits in the area tree. `slot` is its index in the
/// node's list, kept current so removal is a swap-remove.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AreaLink {
    pub node: usize,
    pub list: AreaType,
    pub slot: usize,
}

/// The part of an entity that clients see.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct EntityState {
    pub origin: Vec3,
    pub angles: Vec3,
    /// for lerping
    pub old_origin: Vec3,
    pub modelindex: usize,
    /// packed bounding box hint for client-side prediction
    pub solid: i32,
}

/// Per-client movement state carried between commands.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GClient {
    pub ps: PmoveState,
    /// state after the previous move; any difference means the game moved
    /// the player and the next move must re-snap
    pub old_pmove: PmoveState,
    pub viewangles: Vec3,
    pub buttons: u8,
    pub oldbuttons: u8,
    pub latched_buttons: u8,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Edict {
    pub s: EntityState,
    pub client: Option<GClient>,
    pub inuse: bool,
    pub linkcount: i32,

    /// `None` while not linked into the area tree
    pub area: Option<AreaLink>,

    /// if -1, use headnode instead
    pub num_clusters: i32,
    pub clusternums: [i32; MAX_ENT_CLUSTERS],
    /// unused if num_clusters != -1
    pub headnode: i32,
    pub areanum: i32,
    pub areanum2: i32,

    pub svflags: SvFlags,
    pub mins: Vec3,
    pub maxs: Vec3,
    pub absmin: Vec3,
    pub absmax: Vec3,
    pub size: Vec3,
    pub solid: Solid,
    pub clipmask: i32,
    pub owner: Option<usize>,

    // movement results
    pub velocity: Vec3,
    pub viewheight: f32,
    pub groundentity: Option<usize>,
    pub waterlevel: i32,
    pub watertype: i32,
}

/// Edict number of client slot `client`; edict 0 is the world.
pub fn client_edict(client: usize) -> usize {
    client + 1
}

/// Fixed-capacity entity arena. Edict 0 is the world and is always in use.
#[derive(Debug)]
pub struct EdictPool {
    edicts: Vec<Edict>,
    max_edicts: usize,
}

impl EdictPool {
    pub fn new(max_edicts: usize) -> Self {
        let max_edicts = max_edicts.clamp(1, MAX_EDICTS);
        let world = Edict {
            inuse: true,
            solid: Solid::Bsp,
            ..Edict::default()
        };
        Self {
            edicts: vec![world],
            max_edicts,
        }
    }

    /// One past the highest edict ever handed out.
    pub fn num_edicts(&self) -> usize {
        self.edicts.len()
    }

    pub fn max_edicts(&self) -> usize {
        self.max_edicts
    }

    pub fn edict(&self, idx: usize) -> Option<&Edict> {
        self.edicts.get(idx)
    }

    pub fn edict_mut(&mut self, idx: usize) -> Option<&mut Edict> {
        self.edicts.get_mut(idx)
    }

    pub fn as_slice(&self) -> &[Edict] {
        &self.edicts
    }

    pub fn as_mut_slice(&mut self) -> &mut [Edict] {
        &mut self.edicts
    }

    /// Reuses the lowest free slot, or grows the arena. `None` when every
    /// slot up to `max_edicts` is taken.
    pub fn spawn(&mut self) -> Option<usize> {
        let idx = match self.edicts.iter().skip(1).position(|e| !e.inuse) {
            Some(i) => i + 1,
            None if self.edicts.len() < self.max_edicts => {
                self.edicts.push(Edict::default());
                self.edicts.len() - 1
            }
            None => {
                log::warn!("spawn: no free edicts");
                return None;
            }
        };
        self.edicts[idx] = Edict {
            inuse: true,
            ..Edict::default()
        };
        Some(idx)
    }

    /// Releases `idx`. The entity must already be unlinked; a linked or
    /// world entity is left alone and `false` returned.
    pub fn free(&mut self, idx: usize) -> bool {
        match self.edicts.get_mut(idx) {
            Some(ent) if idx != 0 && ent.area.is_none() => {
                *ent = Edict::default();
                true
            }
            Some(_) => {
                log::warn!("free: edict {} is the world or still linked", idx);
                false
            }
            None => false,
        }
    }
}
