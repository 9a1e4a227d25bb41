// cmtrace.rs -- swept box traces through a BSP tree or a box hull

use crate::cmodel::{CModelContext, ClipHull, CmStats, HullRef};
use crate::q_shared::{
    angle_vectors, dot_product, is_zero, rotate_into_frame, vector_subtract, CSurface, Trace,
    Vec3,
};

/// 1/32 epsilon to keep floating point happy
pub(crate) const DIST_EPSILON: f32 = 0.03125;

/// Leafs gathered for a position test.
const POSITION_TEST_LEAFS: usize = 1024;

/// Everything one trace needs while it walks the tree. Lives on the
/// caller's stack, so any number of traces can run at once.
struct TraceWork<'a> {
    hull: HullRef<'a>,
    nullsurface: &'a CSurface,
    stats: &'a CmStats,

    start: Vec3,
    end: Vec3,
    mins: Vec3,
    maxs: Vec3,
    extents: Vec3,
    ispoint: bool,
    contents: i32,

    trace: Trace,
    /// one bit per brush already tested by this trace
    visited: Vec<u64>,
}

impl<'a> TraceWork<'a> {
    fn new(
        hull: HullRef<'a>,
        nullsurface: &'a CSurface,
        stats: &'a CmStats,
        start: &Vec3,
        end: &Vec3,
        mins: &Vec3,
        maxs: &Vec3,
        brushmask: i32,
    ) -> Self {
        let trace = Trace {
            surface: Some(nullsurface.clone()),
            ..Trace::default()
        };
        Self {
            hull,
            nullsurface,
            stats,
            start: *start,
            end: *end,
            mins: *mins,
            maxs: *maxs,
            extents: [0.0; 3],
            ispoint: false,
            contents: brushmask,
            trace,
            visited: vec![0; hull.brushes.len().div_ceil(64)],
        }
    }

    /// Marks the brush as tested; false if it already was.
    #[inline]
    fn first_visit(&mut self, brush: usize) -> bool {
        let (word, bit) = (brush / 64, 1u64 << (brush % 64));
        if self.visited[word] & bit != 0 {
            return false;
        }
        self.visited[word] |= bit;
        true
    }

    /// Offset from the plane to the box corner that hits it first.
    #[inline]
    fn corner_dist(&self, normal: &Vec3, dist: f32) -> f32 {
        let mut ofs = [0.0f32; 3];
        for j in 0..3 {
            ofs[j] = if normal[j] < 0.0 { self.maxs[j] } else { self.mins[j] };
        }
        dist - dot_product(&ofs, normal)
    }

    fn clip_box_to_brush(&mut self, brush_idx: usize, p1: &Vec3, p2: &Vec3) {
        let hull = self.hull;
        let brush = &hull.brushes[brush_idx];
        if brush.numsides == 0 {
            return;
        }
        CmStats::bump(&self.stats.brush_traces);

        let mut enterfrac: f32 = -1.0;
        let mut leavefrac: f32 = 1.0;
        let mut clipplane = None;
        let mut leadside = None;
        let mut getout = false;
        let mut startout = false;

        let first = brush.firstbrushside as usize;
        for side_idx in first..first + brush.numsides as usize {
            let side = &hull.brushsides[side_idx];
            let plane = &hull.planes[side.plane];

            let dist = if self.ispoint {
                plane.dist
            } else {
                // push the plane out appropriately for mins/maxs
                self.corner_dist(&plane.normal, plane.dist)
            };

            let d1 = dot_product(p1, &plane.normal) - dist;
            let d2 = dot_product(p2, &plane.normal) - dist;

            if d2 > 0.0 {
                getout = true; // endpoint is not in solid
            }
            if d1 > 0.0 {
                startout = true;
            }

            // completely in front of face, no intersection
            if d1 > 0.0 && d2 >= d1 {
                return;
            }
            if d1 <= 0.0 && d2 <= 0.0 {
                continue;
            }

            // crosses face
            if d1 > d2 {
                // enter
                let f = (d1 - DIST_EPSILON) / (d1 - d2);
                if f > enterfrac {
                    enterfrac = f;
                    clipplane = Some(side.plane);
                    leadside = Some(side);
                }
            } else {
                // leave
                let f = (d1 + DIST_EPSILON) / (d1 - d2);
                if f < leavefrac {
                    leavefrac = f;
                }
            }
        }

        if !startout {
            // original point was inside brush
            self.trace.startsolid = true;
            if !getout {
                self.trace.allsolid = true;
            }
            return;
        }

        if enterfrac < leavefrac && enterfrac > -1.0 && enterfrac < self.trace.fraction {
            self.trace.fraction = enterfrac.max(0.0);
            if let Some(p) = clipplane {
                self.trace.plane = hull.planes[p];
            }
            if let Some(side) = leadside {
                let surface = side
                    .surface
                    .and_then(|s| hull.surfaces.get(s))
                    .unwrap_or(self.nullsurface);
                self.trace.surface = Some(surface.clone());
            }
            self.trace.contents = brush.contents;
        }
    }

    fn test_box_in_brush(&mut self, brush_idx: usize) {
        let hull = self.hull;
        let brush = &hull.brushes[brush_idx];
        if brush.numsides == 0 {
            return;
        }

        let first = brush.firstbrushside as usize;
        for side in &hull.brushsides[first..first + brush.numsides as usize] {
            let plane = &hull.planes[side.plane];
            let dist = self.corner_dist(&plane.normal, plane.dist);
            let d1 = dot_product(&self.start, &plane.normal) - dist;

            // if completely in front of face, no intersection
            if d1 > 0.0 {
                return;
            }
        }

        // inside this brush
        self.trace.startsolid = true;
        self.trace.allsolid = true;
        self.trace.fraction = 0.0;
        self.trace.contents = brush.contents;
    }

    /// Calls `f` for each untested brush in the leaf whose contents match the
    /// mask, stopping once the trace is fully blocked.
    fn for_each_leaf_brush<F>(&mut self, leafnum: usize, mut f: F)
    where
        F: FnMut(&mut Self, usize),
    {
        let hull = self.hull;
        let leaf = &hull.leafs[leafnum];
        if leaf.contents & self.contents == 0 {
            return;
        }

        let first = leaf.firstleafbrush as usize;
        for &brushnum in &hull.leafbrushes[first..first + leaf.numleafbrushes as usize] {
            let brushnum = brushnum as usize;
            if !self.first_visit(brushnum) {
                continue; // already checked this brush in another leaf
            }
            if hull.brushes[brushnum].contents & self.contents == 0 {
                continue;
            }
            f(self, brushnum);
            if self.trace.fraction == 0.0 {
                return;
            }
        }
    }

    fn trace_to_leaf(&mut self, leafnum: usize) {
        let (start, end) = (self.start, self.end);
        self.for_each_leaf_brush(leafnum, |w, b| w.clip_box_to_brush(b, &start, &end));
    }

    fn test_in_leaf(&mut self, leafnum: usize) {
        self.for_each_leaf_brush(leafnum, Self::test_box_in_brush);
    }

    fn recursive_hull_check(&mut self, num: i32, p1f: f32, p2f: f32, p1: &Vec3, p2: &Vec3) {
        if self.trace.fraction <= p1f {
            return; // already hit something nearer
        }

        // if < 0, we are in a leaf node
        if num < 0 {
            self.trace_to_leaf((-1 - num) as usize);
            return;
        }

        // find the point distances to the separating plane
        // and the offset for the size of the box
        let node = self.hull.nodes[num as usize];
        let plane = &self.hull.planes[node.plane];

        let (t1, t2, offset);
        if plane.plane_type < 3 {
            let t = plane.plane_type as usize;
            t1 = p1[t] - plane.dist;
            t2 = p2[t] - plane.dist;
            offset = self.extents[t];
        } else {
            t1 = dot_product(&plane.normal, p1) - plane.dist;
            t2 = dot_product(&plane.normal, p2) - plane.dist;
            offset = if self.ispoint {
                0.0
            } else {
                (self.extents[0] * plane.normal[0]).abs()
                    + (self.extents[1] * plane.normal[1]).abs()
                    + (self.extents[2] * plane.normal[2]).abs()
            };
        }

        // see which sides we need to consider
        if t1 >= offset && t2 >= offset {
            self.recursive_hull_check(node.children[0], p1f, p2f, p1, p2);
            return;
        }
        if t1 < -offset && t2 < -offset {
            self.recursive_hull_check(node.children[1], p1f, p2f, p1, p2);
            return;
        }

        // put the crosspoint DIST_EPSILON pixels on the near side
        let (side, frac, frac2) = if t1 < t2 {
            let idist = 1.0 / (t1 - t2);
            (
                1,
                (t1 - offset + DIST_EPSILON) * idist,
                (t1 + offset + DIST_EPSILON) * idist,
            )
        } else if t1 > t2 {
            let idist = 1.0 / (t1 - t2);
            (
                0,
                (t1 + offset + DIST_EPSILON) * idist,
                (t1 - offset - DIST_EPSILON) * idist,
            )
        } else {
            (0, 1.0, 0.0)
        };
        let frac = frac.clamp(0.0, 1.0);
        let frac2 = frac2.clamp(0.0, 1.0);

        // move up to the node
        let midf = p1f + (p2f - p1f) * frac;
        let mid = lerp(p1, p2, frac);
        self.recursive_hull_check(node.children[side], p1f, midf, p1, &mid);

        // go past the node
        let midf2 = p1f + (p2f - p1f) * frac2;
        let mid2 = lerp(p1, p2, frac2);
        self.recursive_hull_check(node.children[side ^ 1], midf2, p2f, &mid2, p2);
    }
}

#[inline]
fn lerp(a: &Vec3, b: &Vec3, f: f32) -> Vec3 {
    [
        a[0] + f * (b[0] - a[0]),
        a[1] + f * (b[1] - a[1]),
        a[2] + f * (b[2] - a[2]),
    ]
}

impl CModelContext {
    /// Sweeps the box `mins..maxs` from `start` to `end` through the tree
    /// rooted at `headnode`, stopping at the first brush matching `brushmask`.
    pub fn box_trace(
        &self,
        start: &Vec3,
        end: &Vec3,
        mins: &Vec3,
        maxs: &Vec3,
        headnode: i32,
        brushmask: i32,
    ) -> Trace {
        self.box_trace_hull(start, end, mins, maxs, &ClipHull::Node(headnode), brushmask)
    }

    pub fn box_trace_hull(
        &self,
        start: &Vec3,
        end: &Vec3,
        mins: &Vec3,
        maxs: &Vec3,
        hull: &ClipHull,
        brushmask: i32,
    ) -> Trace {
        CmStats::bump(&self.stats.traces);

        let view = self.hull_ref(hull);
        let mut work = TraceWork::new(
            view,
            &self.nullsurface,
            &self.stats,
            start,
            end,
            mins,
            maxs,
            brushmask,
        );

        // map not loaded
        if view.nodes.is_empty() {
            return work.trace;
        }

        // check for position test special case
        if start == end {
            let c1 = [
                start[0] + mins[0] - 1.0,
                start[1] + mins[1] - 1.0,
                start[2] + mins[2] - 1.0,
            ];
            let c2 = [
                start[0] + maxs[0] + 1.0,
                start[1] + maxs[1] + 1.0,
                start[2] + maxs[2] + 1.0,
            ];

            let (leafs, _) = view.box_leafnums(&c1, &c2, POSITION_TEST_LEAFS);
            for leafnum in leafs {
                work.test_in_leaf(leafnum);
                if work.trace.allsolid {
                    break;
                }
            }
            work.trace.endpos = *start;
            return work.trace;
        }

        // check for point special case
        if is_zero(mins) && is_zero(maxs) {
            work.ispoint = true;
        } else {
            work.ispoint = false;
            for i in 0..3 {
                work.extents[i] = (-mins[i]).max(maxs[i]);
            }
        }

        // general sweeping through world
        work.recursive_hull_check(view.headnode, 0.0, 1.0, start, end);

        if work.trace.fraction == 1.0 {
            work.trace.endpos = *end;
        } else {
            work.trace.endpos = lerp(start, end, work.trace.fraction);
        }
        work.trace
    }

    /// Same as `box_trace_hull`, with the hull positioned at `origin` and
    /// rotated by `angles`. Handles offset and rotated bmodels.
    pub fn transformed_box_trace(
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
        // subtract origin offset
        let mut start_l = vector_subtract(start, origin);
        let mut end_l = vector_subtract(end, origin);

        // rotate start and end into the models frame of reference
        let rotated = !hull.is_box() && !is_zero(angles);
        if rotated {
            let (forward, right, up) = angle_vectors(angles);
            start_l = rotate_into_frame(&start_l, &forward, &right, &up);
            end_l = rotate_into_frame(&end_l, &forward, &right, &up);
        }

        let mut trace = self.box_trace_hull(&start_l, &end_l, mins, maxs, hull, brushmask);

        if rotated && trace.fraction != 1.0 {
            let a = [-angles[0], -angles[1], -angles[2]];
            let (forward, right, up) = angle_vectors(&a);
            trace.plane.normal = rotate_into_frame(&trace.plane.normal, &forward, &right, &up);
        }

        trace.endpos = lerp(start, end, trace.fraction);
        trace
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures;
    use crate::q_shared::{
        CONTENTS_MONSTER, CONTENTS_SOLID, CONTENTS_WATER, MASK_ALL, MASK_PLAYERSOLID,
        MASK_SOLID, MASK_WATER,
    };

    fn loaded() -> CModelContext {
        let mut cm = CModelContext::new();
        cm.load_map("maps/test.bsp", false, Some(&fixtures::box_room_bsp()))
            .unwrap();
        cm
    }

    const PLAYER_MINS: Vec3 = [-16.0, -16.0, -24.0];
    const PLAYER_MAXS: Vec3 = [16.0, 16.0, 32.0];

    #[test]
    fn test_dist_epsilon() {
        assert_eq!(DIST_EPSILON, 1.0 / 32.0);
    }

    #[test]
    fn test_box_trace_no_map() {
        let cm = CModelContext::new();
        let trace = cm.box_trace(&[0.0; 3], &[100.0, 0.0, 0.0], &PLAYER_MINS, &PLAYER_MAXS, 0, MASK_ALL);
        assert_eq!(trace.fraction, 1.0);
        assert!(!trace.startsolid);
    }

    #[test]
    fn test_point_trace_hits_cube() {
        let cm = loaded();
        let trace = cm.box_trace(&[200.0, 0.0, 0.0], &[0.0, 0.0, 0.0], &[0.0; 3], &[0.0; 3], 0, MASK_SOLID);
        assert!(!trace.startsolid);
        assert!(trace.fraction < 1.0);
        // cube face is x = 64, start at 200, 200 units long
        let expected = (136.0 - DIST_EPSILON) / 200.0;
        assert!((trace.fraction - expected).abs() < 1e-5, "{}", trace.fraction);
        assert_eq!(trace.plane.normal, [1.0, 0.0, 0.0]);
        assert_eq!(trace.contents, CONTENTS_SOLID);
        assert_eq!(trace.surface.as_ref().unwrap().name_str(), fixtures::WALL_TEXTURE);
        assert!(trace.endpos[0] > 64.0 && trace.endpos[0] < 64.1);
        assert_eq!(trace.ent, None);
    }

    #[test]
    fn test_box_trace_stops_box_at_face() {
        let cm = loaded();
        let trace = cm.box_trace(&[200.0, 0.0, 0.0], &[0.0, 0.0, 0.0], &PLAYER_MINS, &PLAYER_MAXS, 0, MASK_PLAYERSOLID);
        // box front reaches x = 64 when origin is at x = 80
        assert!(trace.endpos[0] > 80.0 && trace.endpos[0] < 80.1, "{:?}", trace.endpos);
    }

    #[test]
    fn test_trace_misses() {
        let cm = loaded();
        let start = [100.0, 0.0, 0.0];
        let end = [100.0, 40.0, 10.0];
        let trace = cm.box_trace(&start, &end, &PLAYER_MINS, &PLAYER_MAXS, 0, MASK_SOLID);
        assert_eq!(trace.fraction, 1.0);
        assert_eq!(trace.endpos, end);
    }

    #[test]
    fn test_start_inside_solid() {
        let cm = loaded();
        let p = [0.0, 0.0, 0.0];
        let trace = cm.box_trace(&p, &p, &[0.0; 3], &[0.0; 3], 0, MASK_SOLID);
        assert!(trace.startsolid);
        assert!(trace.allsolid);
        assert_eq!(trace.fraction, 0.0);
        assert_eq!(trace.endpos, p);

        // leaving the solid: startsolid but not allsolid
        let trace = cm.box_trace(&p, &[200.0, 0.0, 0.0], &[0.0; 3], &[0.0; 3], 0, MASK_SOLID);
        assert!(trace.startsolid);
        assert!(!trace.allsolid);
    }

    #[test]
    fn test_mask_shrinking_never_shortens() {
        let cm = loaded();
        let start = [200.0, 10.0, 5.0];
        let end = [-200.0, -10.0, 5.0];
        let masks = [MASK_ALL, MASK_PLAYERSOLID, MASK_SOLID, CONTENTS_SOLID, MASK_WATER, 0];
        let mut last = 0.0;
        for mask in masks {
            let trace = cm.box_trace(&start, &end, &PLAYER_MINS, &PLAYER_MAXS, 0, mask);
            assert!(trace.fraction >= last, "mask {:#x}: {} < {}", mask, trace.fraction, last);
            last = trace.fraction;
        }
        assert_eq!(last, 1.0);
    }

    #[test]
    fn test_box_hull_trace() {
        let cm = CModelContext::new();
        let hull = cm.headnode_for_box(&[-16.0; 3], &[16.0; 3]);

        // wrong content mask passes straight through
        let trace = cm.box_trace_hull(&[-100.0, 0.0, 0.0], &[100.0, 0.0, 0.0], &[0.0; 3], &[0.0; 3], &hull, CONTENTS_SOLID);
        assert_eq!(trace.fraction, 1.0);

        let trace = cm.box_trace_hull(&[-100.0, 0.0, 0.0], &[100.0, 0.0, 0.0], &[0.0; 3], &[0.0; 3], &hull, CONTENTS_MONSTER);
        assert!((trace.fraction - (84.0 - DIST_EPSILON) / 200.0).abs() < 1e-5);
        assert_eq!(trace.plane.normal, [-1.0, 0.0, 0.0]);
        assert_eq!(trace.contents, CONTENTS_MONSTER);

        // position test
        let trace = cm.box_trace_hull(&[0.0; 3], &[0.0; 3], &[0.0; 3], &[0.0; 3], &hull, CONTENTS_MONSTER);
        assert!(trace.startsolid && trace.allsolid);
        assert_eq!(trace.contents, CONTENTS_MONSTER);
    }

    #[test]
    fn test_transformed_box_trace_rotates_normal_back() {
        let cm = loaded();
        let hull = cm.model_hull(1).unwrap();
        // model brush spans x in [0, 64]; turned 90 degrees it spans y in [0, 64]
        let start = [0.0, 32.0, 100.0];
        let end = [0.0, 32.0, -100.0];
        let trace = cm.transformed_box_trace(&start, &end, &[0.0; 3], &[0.0; 3], &hull, MASK_SOLID, &[0.0; 3], &[0.0, 90.0, 0.0]);
        assert!(trace.fraction < 1.0);
        assert!((trace.plane.normal[2] - 1.0).abs() < 1e-5, "{:?}", trace.plane.normal);
        assert!((trace.endpos[2] - 8.0).abs() < 0.1, "{:?}", trace.endpos);

        let trace = cm.transformed_box_trace(&start, &end, &[0.0; 3], &[0.0; 3], &hull, MASK_SOLID, &[0.0; 3], &[0.0; 3]);
        assert_eq!(trace.fraction, 1.0);

        // translated model
        let trace = cm.transformed_box_trace(&[32.0, 100.0, 0.0], &[32.0, -100.0, 0.0], &[0.0; 3], &[0.0; 3], &hull, MASK_SOLID, &[0.0, 50.0, 0.0], &[0.0; 3]);
        assert!((trace.endpos[1] - 58.0).abs() < 0.1, "{:?}", trace.endpos);
    }

    #[test]
    fn test_brush_counted_once_per_trace() {
        let cm = loaded();
        cm.stats.reset();
        // crosses every node of the world tree, but only one brush exists there
        cm.box_trace(&[-200.0, -200.0, -200.0], &[200.0, 200.0, 200.0], &[0.0; 3], &[0.0; 3], 0, MASK_ALL);
        let (traces, brush_traces, _) = cm.stats.snapshot();
        assert_eq!(traces, 1);
        assert_eq!(brush_traces, 1);
    }

    #[test]
    fn test_water_brush_not_hit_by_solid_mask() {
        let mut cm = CModelContext::new();
        cm.load_map("maps/many.bsp", false, Some(&fixtures::many_brushes_bsp(4)))
            .unwrap();
        let trace = cm.box_trace(&[200.0, 0.0, 0.0], &[0.0, 0.0, 0.0], &[0.0; 3], &[0.0; 3], 0, CONTENTS_WATER);
        assert_eq!(trace.fraction, 1.0);
    }

    #[test]
    fn test_traces_are_deterministic_across_threads() {
        use rayon::prelude::*;
        let cm = loaded();
        let start = [200.0, 30.0, 3.0];
        let end = [-20.0, -5.0, 0.0];
        let reference = cm.box_trace(&start, &end, &PLAYER_MINS, &PLAYER_MAXS, 0, MASK_SOLID);
        let all: Vec<Trace> = (0..32)
            .into_par_iter()
            .map(|_| cm.box_trace(&start, &end, &PLAYER_MINS, &PLAYER_MAXS, 0, MASK_SOLID))
            .collect();
        assert!(all.iter().all(|t| *t == reference));
    }
}
