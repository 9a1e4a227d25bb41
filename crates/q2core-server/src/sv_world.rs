// sv_world.rs -- world query functions
//
// Entity area checking: spatial partitioning via area nodes,
// linking/unlinking entities, box queries, point contents, and tracing.

use crate::edict::{AreaLink, Edict, Solid, SvFlags};
use q2core_common::cmodel::{CModelContext, ClipHull};
use q2core_common::q_shared::*;
use q2core_common::{CmError, CmResult};
use thiserror::Error;

// ===============================================================================
// ENTITY AREA CHECKING
// ===============================================================================

pub const AREA_DEPTH: usize = 4;
pub const AREA_NODES: usize = 32;
pub const MAX_TOTAL_ENT_LEAFS: usize = 128;

#[derive(Debug, Error, PartialEq)]
pub enum SvError {
    #[error(transparent)]
    Cm(#[from] CmError),

    /// A SOLID_BSP entity whose model index is not a loaded brush model
    #[error("entity {ent}: SOLID_BSP with a non bsp model (index {modelindex})")]
    MissingBspModel { ent: usize, modelindex: usize },

    #[error("bad edict number {0}")]
    BadEdict(usize),

    #[error("edict {0} is not a client")]
    NotAClient(usize),
}

// ============================================================
// Area node (spatial partitioning BSP for entities)
// ============================================================

#[derive(Debug, Clone, Default)]
pub struct AreaNode {
    /// `None` for a terminal node
    pub axis: Option<usize>,
    pub dist: f32,
    /// child 0 holds the half above `dist`
    pub children: [usize; 2],
    pub trigger_edicts: Vec<usize>,
    pub solid_edicts: Vec<usize>,
}

impl AreaNode {
    fn list(&self, which: AreaType) -> &Vec<usize> {
        match which {
            AreaType::Solid => &self.solid_edicts,
            AreaType::Triggers => &self.trigger_edicts,
        }
    }

    fn list_mut(&mut self, which: AreaType) -> &mut Vec<usize> {
        match which {
            AreaType::Solid => &mut self.solid_edicts,
            AreaType::Triggers => &mut self.trigger_edicts,
        }
    }
}

// ============================================================
// MoveClip -- per-trace state
// ============================================================

struct MoveClip<'a> {
    boxmins: Vec3,
    boxmaxs: Vec3,
    mins: &'a Vec3,
    maxs: &'a Vec3,
    // monster box; the same size as the moving box
    mins2: &'a Vec3,
    maxs2: &'a Vec3,
    start: &'a Vec3,
    end: &'a Vec3,
    trace: Trace,
    passedict: Option<usize>,
    contentmask: i32,
}

// ============================================================
// Collision model trait
// ============================================================

/// The collision-model queries the area tree and move clipping need.
/// Implemented by `CModelContext`; tests substitute their own.
pub trait CollisionModel: Sync {
    /// Leafs touched by the box (at most `maxcount`) and the first node the
    /// box straddles, -1 if none.
    fn box_leafnums(&self, mins: &Vec3, maxs: &Vec3, maxcount: usize) -> (Vec<usize>, i32);
    fn leaf_cluster(&self, leafnum: usize) -> CmResult<i32>;
    fn leaf_area(&self, leafnum: usize) -> CmResult<i32>;
    fn point_contents(&self, p: &Vec3, headnode: i32) -> i32;
    fn transformed_point_contents(
        &self,
        p: &Vec3,
        hull: &ClipHull,
        origin: &Vec3,
        angles: &Vec3,
    ) -> i32;
    fn headnode_for_box(&self, mins: &Vec3, maxs: &Vec3) -> ClipHull;
    fn box_trace(
        &self,
        start: &Vec3,
        end: &Vec3,
        mins: &Vec3,
        maxs: &Vec3,
        headnode: i32,
        brushmask: i32,
    ) -> Trace;
    fn transformed_box_trace(
        &self,
        start: &Vec3,
        end: &Vec3,
        mins: &Vec3,
        maxs: &Vec3,
        hull: &ClipHull,
        brushmask: i32,
        origin: &Vec3,
        angles: &Vec3,
    ) -> Trace;
}

impl CollisionModel for CModelContext {
    fn box_leafnums(&self, mins: &Vec3, maxs: &Vec3, maxcount: usize) -> (Vec<usize>, i32) {
        CModelContext::box_leafnums(self, mins, maxs, maxcount)
    }

    fn leaf_cluster(&self, leafnum: usize) -> CmResult<i32> {
        CModelContext::leaf_cluster(self, leafnum)
    }

    fn leaf_area(&self, leafnum: usize) -> CmResult<i32> {
        CModelContext::leaf_area(self, leafnum)
    }

    fn point_contents(&self, p: &Vec3, headnode: i32) -> i32 {
        CModelContext::point_contents(self, p, headnode)
    }

    fn transformed_point_contents(
        &self,
        p: &Vec3,
        hull: &ClipHull,
        origin: &Vec3,
        angles: &Vec3,
    ) -> i32 {
        CModelContext::transformed_point_contents(self, p, hull, origin, angles)
    }

    fn headnode_for_box(&self, mins: &Vec3, maxs: &Vec3) -> ClipHull {
        CModelContext::headnode_for_box(self, mins, maxs)
    }

    fn box_trace(
        &self,
        start: &Vec3,
        end: &Vec3,
        mins: &Vec3,
        maxs: &Vec3,
        headnode: i32,
        brushmask: i32,
    ) -> Trace {
        CModelContext::box_trace(self, start, end, mins, maxs, headnode, brushmask)
    }

    fn transformed_box_trace(
        &self,
        start: &Vec3,
        end: &Vec3,
        mins: &Vec3,
        maxs: &Vec3,
        hull: &ClipHull,
        brushmask: i32,
        origin: &Vec3,
        angles: &Vec3,
    ) -> Trace {
        CModelContext::transformed_box_trace(
            self, start, end, mins, maxs, hull, brushmask, origin, angles,
        )
    }
}

// ============================================================
// SvWorldContext
// ============================================================

#[derive(Debug, Default)]
pub struct SvWorldContext {
    pub areanodes: Vec<AreaNode>,
    pub numareanodes: usize,
}

impl SvWorldContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a uniformly subdivided tree for the given world size.
    /// Returns the index of the created node.
    fn create_area_node(&mut self, depth: usize, mins: &Vec3, maxs: &Vec3) -> usize {
        let anode = self.numareanodes;
        self.numareanodes += 1;
        self.areanodes[anode] = AreaNode::default();

        if depth == AREA_DEPTH {
            return anode;
        }

        let size = vector_subtract(maxs, mins);
        let axis = if size[0] > size[1] { 0 } else { 1 };
        let dist = 0.5 * (maxs[axis] + mins[axis]);

        let mut mins2 = *mins;
        let mut maxs1 = *maxs;
        maxs1[axis] = dist;
        mins2[axis] = dist;

        let child0 = self.create_area_node(depth + 1, &mins2, maxs);
        let child1 = self.create_area_node(depth + 1, mins, &maxs1);

        let node = &mut self.areanodes[anode];
        node.axis = Some(axis);
        node.dist = dist;
        node.children = [child0, child1];
        anode
    }

    /// Rebuilds the area tree. Entities linked before are forgotten; the
    /// caller is expected to respawn them.
    pub fn clear_world(&mut self, world_mins: &Vec3, world_maxs: &Vec3) {
        self.areanodes.clear();
        self.areanodes.resize(AREA_NODES, AreaNode::default());
        self.numareanodes = 0;
        self.create_area_node(0, world_mins, world_maxs);
    }

    /// Loads a level into `cm` and sizes the area tree from its world model.
    pub fn load_level(
        &mut self,
        cm: &mut CModelContext,
        name: &str,
        buf: Option<&[u8]>,
    ) -> Result<(CModel, u32), SvError> {
        let (world, checksum) = cm.load_map(name, false, buf)?;
        self.clear_world(&world.mins, &world.maxs);
        log::debug!("{}: area tree built with {} nodes", name, self.numareanodes);
        Ok((world, checksum))
    }

    /// Loaded models indexed by entity `modelindex`: 0 is unused, 1 is the
    /// world, then inline models `*1` onward.
    pub fn model_table(cm: &CModelContext) -> Result<Vec<Option<CModel>>, SvError> {
        let mut models = vec![None, cm.map_cmodels.first().copied()];
        for n in 1..cm.num_inline_models() {
            models.push(Some(*cm.inline_model(&format!("*{}", n))?));
        }
        Ok(models)
    }

    pub fn unlink_edict(&mut self, edicts: &mut [Edict], ent: usize) {
        let Some(link) = edicts.get_mut(ent).and_then(|e| e.area.take()) else {
            return; // not linked in anywhere
        };

        let Some(node) = self.areanodes.get_mut(link.node) else {
            return;
        };
        let list = node.list_mut(link.list);
        if list.get(link.slot) != Some(&ent) {
            // the tree was rebuilt since this entity was linked
            log::warn!("unlink_edict: stale area link for entity {}", ent);
            return;
        }

        list.swap_remove(link.slot);
        if let Some(&moved) = list.get(link.slot) {
            if let Some(l) = edicts[moved].area.as_mut() {
                l.slot = link.slot;
            }
        }
    }

    /// Relinks `ent_idx` at its current position. A leaf lookup failure
    /// leaves the entity unlinked.
    pub fn link_edict(
        &mut self,
        edicts: &mut [Edict],
        ent_idx: usize,
        cm: &dyn CollisionModel,
    ) -> Result<(), SvError> {
        self.unlink_edict(edicts, ent_idx); // unlink from old position

        if ent_idx == 0 {
            return Ok(()); // don't add the world
        }
        if self.numareanodes == 0 {
            log::warn!("link_edict: entity {} linked before the world was cleared", ent_idx);
            return Ok(());
        }

        let Some(ent) = edicts.get_mut(ent_idx) else {
            return Err(SvError::BadEdict(ent_idx));
        };
        if !ent.inuse {
            return Ok(());
        }

        // set the size
        ent.size = vector_subtract(&ent.maxs, &ent.mins);

        // encode the size into the entity_state for client prediction
        if ent.solid == Solid::Bbox && !ent.svflags.contains(SvFlags::DEADMONSTER) {
            // assume that x/y are equal and symmetric
            let i = ((ent.maxs[0] / 8.0) as i32).clamp(1, 31);
            // z is not symmetric
            let j = ((-ent.mins[2] / 8.0) as i32).clamp(1, 31);
            // and z maxs can be negative...
            let k = (((ent.maxs[2] + 32.0) / 8.0) as i32).clamp(1, 63);
            ent.s.solid = (k << 10) | (j << 5) | i;
        } else if ent.solid == Solid::Bsp {
            ent.s.solid = 31; // a solid_bbox will never create this value
        } else {
            ent.s.solid = 0;
        }

        // set the abs box
        if ent.solid == Solid::Bsp && !is_zero(&ent.s.angles) {
            // expand for rotation
            let max = ent
                .mins
                .iter()
                .chain(ent.maxs.iter())
                .fold(0.0f32, |m, v| m.max(v.abs()));
            for i in 0..3 {
                ent.absmin[i] = ent.s.origin[i] - max;
                ent.absmax[i] = ent.s.origin[i] + max;
            }
        } else {
            // normal
            ent.absmin = vector_add(&ent.s.origin, &ent.mins);
            ent.absmax = vector_add(&ent.s.origin, &ent.maxs);
        }

        // because movement is clipped an epsilon away from an actual edge,
        // we must fully check even when bounding boxes don't quite touch
        for i in 0..3 {
            ent.absmin[i] -= 1.0;
            ent.absmax[i] += 1.0;
        }

        // link to PVS leafs
        ent.num_clusters = 0;
        ent.areanum = 0;
        ent.areanum2 = 0;

        // get all leafs, including solids
        let (leafs, topnode) = cm.box_leafnums(&ent.absmin, &ent.absmax, MAX_TOTAL_ENT_LEAFS);

        // set areas
        let mut clusters = Vec::with_capacity(leafs.len());
        for &leaf in &leafs {
            clusters.push(cm.leaf_cluster(leaf)?);
            let area = cm.leaf_area(leaf)?;
            if area != 0 {
                // doors may legally straddle two areas,
                // but nothing should ever need more than that
                if ent.areanum != 0 && ent.areanum != area {
                    if ent.areanum2 != 0 && ent.areanum2 != area {
                        log::debug!(
                            "object touching 3 areas at {} {} {}",
                            ent.absmin[0],
                            ent.absmin[1],
                            ent.absmin[2]
                        );
                    }
                    ent.areanum2 = area;
                } else {
                    ent.areanum = area;
                }
            }
        }

        if leafs.len() >= MAX_TOTAL_ENT_LEAFS {
            // assume we missed some leafs, and mark by headnode
            ent.num_clusters = -1;
            ent.headnode = topnode;
        } else {
            for (i, &cluster) in clusters.iter().enumerate() {
                if cluster == -1 {
                    continue; // not a visible leaf
                }
                if clusters[..i].contains(&cluster) {
                    continue;
                }
                if ent.num_clusters == MAX_ENT_CLUSTERS as i32 {
                    // assume we missed some leafs, and mark by headnode
                    ent.num_clusters = -1;
                    ent.headnode = topnode;
                    break;
                }
                ent.clusternums[ent.num_clusters as usize] = cluster;
                ent.num_clusters += 1;
            }
        }

        // if first time, make sure old_origin is valid
        if ent.linkcount == 0 {
            ent.s.old_origin = ent.s.origin;
        }
        ent.linkcount += 1;

        if ent.solid == Solid::Not {
            return Ok(());
        }

        // find the first node that the ent's box crosses
        let mut node_idx = 0;
        while let Some(axis) = self.areanodes[node_idx].axis {
            let node = &self.areanodes[node_idx];
            if ent.absmin[axis] > node.dist {
                node_idx = node.children[0];
            } else if ent.absmax[axis] < node.dist {
                node_idx = node.children[1];
            } else {
                break; // crosses the node
            }
        }

        // link it in
        let which = if ent.solid == Solid::Trigger {
            AreaType::Triggers
        } else {
            AreaType::Solid
        };
        let list = self.areanodes[node_idx].list_mut(which);
        ent.area = Some(AreaLink {
            node: node_idx,
            list: which,
            slot: list.len(),
        });
        list.push(ent_idx);
        Ok(())
    }

    /// Returns false once `area_maxcount` has been reached.
    fn area_edicts_r(
        &self,
        node_idx: usize,
        edicts: &[Edict],
        area_mins: &Vec3,
        area_maxs: &Vec3,
        area_type: AreaType,
        area_list: &mut Vec<usize>,
        area_maxcount: usize,
    ) -> bool {
        let node = &self.areanodes[node_idx];

        // touch linked edicts
        for &check_idx in node.list(area_type) {
            let check = &edicts[check_idx];

            if check.solid == Solid::Not {
                continue; // deactivated
            }
            if check.absmin[0] > area_maxs[0]
                || check.absmin[1] > area_maxs[1]
                || check.absmin[2] > area_maxs[2]
                || check.absmax[0] < area_mins[0]
                || check.absmax[1] < area_mins[1]
                || check.absmax[2] < area_mins[2]
            {
                continue; // not touching
            }

            if area_list.len() == area_maxcount {
                log::warn!("area_edicts: MAXCOUNT");
                return false;
            }

            area_list.push(check_idx);
        }

        let Some(axis) = node.axis else {
            return true; // terminal node
        };

        // recurse down both sides
        if area_maxs[axis] > node.dist
            && !self.area_edicts_r(
                node.children[0],
                edicts,
                area_mins,
                area_maxs,
                area_type,
                area_list,
                area_maxcount,
            )
        {
            return false;
        }
        if area_mins[axis] < node.dist {
            return self.area_edicts_r(
                node.children[1],
                edicts,
                area_mins,
                area_maxs,
                area_type,
                area_list,
                area_maxcount,
            );
        }
        true
    }

    /// Entities of `areatype` whose padded box touches `mins..maxs`, at most
    /// `maxcount` of them.
    pub fn area_edicts(
        &self,
        mins: &Vec3,
        maxs: &Vec3,
        edicts: &[Edict],
        maxcount: usize,
        areatype: AreaType,
    ) -> Vec<usize> {
        let mut list = Vec::new();
        if self.numareanodes > 0 {
            self.area_edicts_r(0, edicts, mins, maxs, areatype, &mut list, maxcount);
        }
        list
    }

    /// Returns a hull that can be used for testing or clipping an object of
    /// mins/maxs size.
    pub fn hull_for_entity(
        edicts: &[Edict],
        ent_idx: usize,
        models: &[Option<CModel>],
        cm: &dyn CollisionModel,
    ) -> Result<ClipHull, SvError> {
        let ent = edicts.get(ent_idx).ok_or(SvError::BadEdict(ent_idx))?;

        // decide which clipping hull to use, based on the size
        if ent.solid == Solid::Bsp {
            // explicit hulls in the BSP model
            let modelindex = ent.s.modelindex;
            return models
                .get(modelindex)
                .and_then(|m| m.as_ref())
                .map(|m| ClipHull::Node(m.headnode))
                .ok_or(SvError::MissingBspModel {
                    ent: ent_idx,
                    modelindex,
                });
        }

        // create a temp hull from bounding box sizes
        Ok(cm.headnode_for_box(&ent.mins, &ent.maxs))
    }

    pub fn point_contents(
        &self,
        p: &Vec3,
        edicts: &[Edict],
        models: &[Option<CModel>],
        cm: &dyn CollisionModel,
    ) -> Result<i32, SvError> {
        // get base contents from world
        let mut contents = cm.point_contents(p, 0);

        // or in contents from all the other entities
        let touch = self.area_edicts(p, p, edicts, MAX_EDICTS, AreaType::Solid);

        for hit_idx in touch {
            let hit = &edicts[hit_idx];

            // might intersect, so do an exact clip
            let hull = Self::hull_for_entity(edicts, hit_idx, models, cm)?;
            let angles = if hit.solid != Solid::Bsp {
                &VEC3_ORIGIN // boxes don't rotate
            } else {
                &hit.s.angles
            };

            contents |= cm.transformed_point_contents(p, &hull, &hit.s.origin, angles);
        }

        Ok(contents)
    }

    fn clip_move_to_entities(
        &self,
        clip: &mut MoveClip<'_>,
        edicts: &[Edict],
        models: &[Option<CModel>],
        cm: &dyn CollisionModel,
    ) -> Result<(), SvError> {
        let touchlist =
            self.area_edicts(&clip.boxmins, &clip.boxmaxs, edicts, MAX_EDICTS, AreaType::Solid);

        for touch_idx in touchlist {
            let touch = &edicts[touch_idx];

            if touch.solid == Solid::Not {
                continue;
            }
            if Some(touch_idx) == clip.passedict {
                continue;
            }
            if clip.trace.allsolid {
                return Ok(());
            }
            if let Some(pass) = clip.passedict {
                if touch.owner == Some(pass) {
                    continue; // don't clip against own missiles
                }
                if edicts.get(pass).and_then(|p| p.owner) == Some(touch_idx) {
                    continue; // don't clip against owner
                }
            }

            if clip.contentmask & CONTENTS_DEADMONSTER == 0
                && touch.svflags.contains(SvFlags::DEADMONSTER)
            {
                continue;
            }

            // might intersect, so do an exact clip
            let hull = Self::hull_for_entity(edicts, touch_idx, models, cm)?;
            let angles = if touch.solid != Solid::Bsp {
                &VEC3_ORIGIN // boxes don't rotate
            } else {
                &touch.s.angles
            };

            let (mins, maxs) = if touch.svflags.contains(SvFlags::MONSTER) {
                (clip.mins2, clip.maxs2)
            } else {
                (clip.mins, clip.maxs)
            };
            let mut trace = cm.transformed_box_trace(
                clip.start,
                clip.end,
                mins,
                maxs,
                &hull,
                clip.contentmask,
                &touch.s.origin,
                angles,
            );

            if trace.allsolid || trace.startsolid || trace.fraction < clip.trace.fraction {
                trace.ent = Some(touch_idx);
                if clip.trace.startsolid {
                    clip.trace = trace;
                    clip.trace.startsolid = true;
                } else {
                    clip.trace = trace;
                }
            } else if trace.startsolid {
                clip.trace.startsolid = true;
            }
        }
        Ok(())
    }

    fn trace_bounds(start: &Vec3, mins: &Vec3, maxs: &Vec3, end: &Vec3) -> (Vec3, Vec3) {
        let mut boxmins = [0.0; 3];
        let mut boxmaxs = [0.0; 3];
        for i in 0..3 {
            if end[i] > start[i] {
                boxmins[i] = start[i] + mins[i] - 1.0;
                boxmaxs[i] = end[i] + maxs[i] + 1.0;
            } else {
                boxmins[i] = end[i] + mins[i] - 1.0;
                boxmaxs[i] = start[i] + maxs[i] + 1.0;
            }
        }
        (boxmins, boxmaxs)
    }

    /// Moves the given mins/maxs volume through the world from start to end.
    /// `passedict` and edicts owned by it are explicitly not checked.
    pub fn trace(
        &self,
        start: &Vec3,
        mins: &Vec3,
        maxs: &Vec3,
        end: &Vec3,
        passedict: Option<usize>,
        contentmask: i32,
        edicts: &[Edict],
        models: &[Option<CModel>],
        cm: &dyn CollisionModel,
    ) -> Result<Trace, SvError> {
        // clip to world
        let mut world = cm.box_trace(start, end, mins, maxs, 0, contentmask);
        world.ent = Some(0);
        if world.fraction == 0.0 {
            return Ok(world); // blocked by the world
        }

        // create the bounding box of the entire move
        let (boxmins, boxmaxs) = Self::trace_bounds(start, mins, maxs, end);

        let mut clip = MoveClip {
            boxmins,
            boxmaxs,
            mins,
            maxs,
            mins2: mins,
            maxs2: maxs,
            start,
            end,
            trace: world,
            passedict,
            contentmask,
        };

        // clip to other solid entities
        self.clip_move_to_entities(&mut clip, edicts, models, cm)?;

        Ok(clip.trace)
    }
}
