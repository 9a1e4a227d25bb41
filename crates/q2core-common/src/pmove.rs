// pmove.rs -- deterministic player movement, shared by server simulation and client prediction

use crate::cvar::CvarContext;
use crate::q_shared::{
    angle_vectors, cross_product, dot_product, short2angle, vector_length, vector_ma,
    vector_normalize, vector_scale, CPlane, CSurface, PmFlags, PmType, PmoveData, Trace, Vec3,
    CONTENTS_CURRENT_0, CONTENTS_CURRENT_180, CONTENTS_CURRENT_270, CONTENTS_CURRENT_90,
    CONTENTS_CURRENT_DOWN, CONTENTS_CURRENT_UP, CONTENTS_LADDER, CONTENTS_SLIME, CONTENTS_SOLID,
    CONTENTS_WATER, MASK_CURRENT, MASK_WATER, MAX_CLIP_PLANES, PITCH, ROLL, SURF_SLICK, VEC3_ORIGIN,
    YAW,
};

pub const STEPSIZE: f32 = 18.0;
const STOP_EPSILON: f32 = 0.1;
const MIN_STEP_NORMAL: f32 = 0.7;
const OVERCLIP: f32 = 1.01;

/// Movement tuning, snapshotted from the `pm_*` variables once per tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PmoveParams {
    pub stopspeed: f32,
    pub maxspeed: f32,
    pub duckspeed: f32,
    pub accelerate: f32,
    pub airaccelerate: f32,
    pub wateraccelerate: f32,
    pub friction: f32,
    pub waterfriction: f32,
    pub waterspeed: f32,
}

impl Default for PmoveParams {
    fn default() -> Self {
        Self {
            stopspeed: 100.0,
            maxspeed: 300.0,
            duckspeed: 100.0,
            accelerate: 10.0,
            airaccelerate: 0.0,
            wateraccelerate: 10.0,
            friction: 6.0,
            waterfriction: 1.0,
            waterspeed: 400.0,
        }
    }
}

impl PmoveParams {
    /// Reads the registered `pm_*` variables; missing ones keep their default.
    pub fn from_cvars(cvars: &CvarContext) -> Self {
        let d = Self::default();
        let get = |name: &str, default: f32| cvars.find_var(name).map_or(default, |v| v.value);
        Self {
            stopspeed: get("pm_stopspeed", d.stopspeed),
            maxspeed: get("pm_maxspeed", d.maxspeed),
            duckspeed: get("pm_duckspeed", d.duckspeed),
            accelerate: get("pm_accelerate", d.accelerate),
            airaccelerate: get("pm_airaccelerate", d.airaccelerate),
            wateraccelerate: get("pm_wateraccelerate", d.wateraccelerate),
            friction: get("pm_friction", d.friction),
            waterfriction: get("pm_waterfriction", d.waterfriction),
            waterspeed: get("pm_waterspeed", d.waterspeed),
        }
    }
}

/// World queries the movement code needs. The server answers them with
/// move clipping, the client with its predicted world.
pub trait PmoveCallbacks {
    fn trace(&self, start: &Vec3, mins: &Vec3, maxs: &Vec3, end: &Vec3) -> Trace;
    fn pointcontents(&self, point: &Vec3) -> i32;
}

// all of the locals will be zeroed before each pmove, just to make sure
// we don't have any differences when running on client or server
#[derive(Debug, Clone, Default)]
struct PmLocal {
    origin: Vec3,
    velocity: Vec3,

    forward: Vec3,
    right: Vec3,
    up: Vec3,
    frametime: f32,

    groundsurface: Option<CSurface>,
    groundplane: CPlane,
    groundcontents: i32,

    previous_origin: [i16; 3],
    ladder: bool,
}

struct PmoveContext<'a, C: PmoveCallbacks> {
    pm: &'a mut PmoveData,
    pml: PmLocal,
    params: &'a PmoveParams,
    cb: &'a C,
}

/// Slide off of the impacting surface.
fn clip_velocity(inv: &Vec3, normal: &Vec3, overbounce: f32) -> Vec3 {
    let backoff = dot_product(inv, normal) * overbounce;
    let mut out = [0.0; 3];
    for i in 0..3 {
        out[i] = inv[i] - normal[i] * backoff;
        if out[i] > -STOP_EPSILON && out[i] < STOP_EPSILON {
            out[i] = 0.0;
        }
    }
    out
}

/// Unit push for each current bit set in `contents`.
fn current_direction(contents: i32) -> Vec3 {
    let mut v = [0.0; 3];
    if contents & CONTENTS_CURRENT_0 != 0 {
        v[0] += 1.0;
    }
    if contents & CONTENTS_CURRENT_90 != 0 {
        v[1] += 1.0;
    }
    if contents & CONTENTS_CURRENT_180 != 0 {
        v[0] -= 1.0;
    }
    if contents & CONTENTS_CURRENT_270 != 0 {
        v[1] -= 1.0;
    }
    if contents & CONTENTS_CURRENT_UP != 0 {
        v[2] += 1.0;
    }
    if contents & CONTENTS_CURRENT_DOWN != 0 {
        v[2] -= 1.0;
    }
    v
}

impl<C: PmoveCallbacks> PmoveContext<'_, C> {
    fn trace(&self, start: &Vec3, end: &Vec3) -> Trace {
        self.cb.trace(start, &self.pm.mins, &self.pm.maxs, end)
    }

    fn on_ground(&self) -> bool {
        self.pm.groundentity.is_some()
    }

    /// Slides along every plane hit during the frame, up to four bumps.
    fn step_slide_move_inner(&mut self) {
        let numbumps = 4;
        let primal_velocity = self.pml.velocity;
        let mut numplanes = 0;
        let mut planes = [[0.0f32; 3]; MAX_CLIP_PLANES];

        let mut time_left = self.pml.frametime;

        for _ in 0..numbumps {
            let end = vector_ma(&self.pml.origin, time_left, &self.pml.velocity);
            let trace = self.trace(&self.pml.origin, &end);

            if trace.allsolid {
                // entity is trapped in another solid
                self.pml.velocity[2] = 0.0; // don't build up falling damage
                return;
            }

            if trace.fraction > 0.0 {
                // actually covered some distance
                self.pml.origin = trace.endpos;
                numplanes = 0;
            }

            if trace.fraction == 1.0 {
                break; // moved the entire distance
            }

            // save entity for contact
            self.pm.add_touch(trace.ent);

            time_left -= time_left * trace.fraction;

            // slide along this plane
            if numplanes >= MAX_CLIP_PLANES {
                // this shouldn't really happen
                self.pml.velocity = VEC3_ORIGIN;
                break;
            }

            planes[numplanes] = trace.plane.normal;
            numplanes += 1;

            // modify velocity so it parallels all of the clip planes
            let mut found = false;
            for i in 0..numplanes {
                self.pml.velocity = clip_velocity(&self.pml.velocity, &planes[i], OVERCLIP);
                let ok = (0..numplanes)
                    .all(|j| j == i || dot_product(&self.pml.velocity, &planes[j]) >= 0.0);
                if ok {
                    found = true;
                    break;
                }
            }

            if !found {
                // go along the crease
                if numplanes != 2 {
                    self.pml.velocity = VEC3_ORIGIN;
                    break;
                }
                let dir = cross_product(&planes[0], &planes[1]);
                let d = dot_product(&dir, &self.pml.velocity);
                self.pml.velocity = vector_scale(&dir, d);
            }

            // if velocity is against the original velocity, stop dead
            // to avoid tiny occilations in sloping corners
            if dot_product(&self.pml.velocity, &primal_velocity) <= 0.0 {
                self.pml.velocity = VEC3_ORIGIN;
                break;
            }
        }

        if self.pm.s.pm_time != 0 {
            self.pml.velocity = primal_velocity;
        }
    }

    fn step_slide_move(&mut self) {
        let start_o = self.pml.origin;
        let start_v = self.pml.velocity;

        self.step_slide_move_inner();

        let down_o = self.pml.origin;
        let down_v = self.pml.velocity;

        let mut up = start_o;
        up[2] += STEPSIZE;

        let trace = self.trace(&up, &up);
        if trace.allsolid {
            return; // can't step up
        }

        // try sliding above
        self.pml.origin = up;
        self.pml.velocity = start_v;

        self.step_slide_move_inner();

        // push down the final amount
        let mut down = self.pml.origin;
        down[2] -= STEPSIZE;
        let trace = self.trace(&self.pml.origin, &down);
        if !trace.allsolid {
            self.pml.origin = trace.endpos;
        }

        let up = self.pml.origin;

        // decide which one went farther
        let down_dist = (down_o[0] - start_o[0]).powi(2) + (down_o[1] - start_o[1]).powi(2);
        let up_dist = (up[0] - start_o[0]).powi(2) + (up[1] - start_o[1]).powi(2);

        if down_dist > up_dist || trace.plane.normal[2] < MIN_STEP_NORMAL {
            self.pml.origin = down_o;
            self.pml.velocity = down_v;
            return;
        }
        // if we were walking along a plane, then we need to copy the Z over
        self.pml.velocity[2] = down_v[2];
    }

    /// Handles both ground friction and water friction.
    fn friction(&mut self) {
        let speed = vector_length(&self.pml.velocity);
        if speed < 1.0 {
            self.pml.velocity[0] = 0.0;
            self.pml.velocity[1] = 0.0;
            return;
        }

        let mut drop = 0.0;

        // apply ground friction
        let slick = self
            .pml
            .groundsurface
            .as_ref()
            .is_some_and(|s| s.flags & SURF_SLICK != 0);
        if (self.on_ground() && self.pml.groundsurface.is_some() && !slick) || self.pml.ladder {
            let control = speed.max(self.params.stopspeed);
            drop += control * self.params.friction * self.pml.frametime;
        }

        // apply water friction
        if self.pm.waterlevel != 0 && !self.pml.ladder {
            drop += speed
                * self.params.waterfriction
                * self.pm.waterlevel as f32
                * self.pml.frametime;
        }

        let newspeed = (speed - drop).max(0.0) / speed;
        self.pml.velocity = vector_scale(&self.pml.velocity, newspeed);
    }

    fn accelerate(&mut self, wishdir: &Vec3, wishspeed: f32, accel: f32) {
        let currentspeed = dot_product(&self.pml.velocity, wishdir);
        let addspeed = wishspeed - currentspeed;
        if addspeed <= 0.0 {
            return;
        }
        let accelspeed = (accel * self.pml.frametime * wishspeed).min(addspeed);
        self.pml.velocity = vector_ma(&self.pml.velocity, accelspeed, wishdir);
    }

    fn air_accelerate(&mut self, wishdir: &Vec3, wishspeed: f32, accel: f32) {
        let wishspd = wishspeed.min(30.0);
        let currentspeed = dot_product(&self.pml.velocity, wishdir);
        let addspeed = wishspd - currentspeed;
        if addspeed <= 0.0 {
            return;
        }
        let accelspeed = (accel * wishspeed * self.pml.frametime).min(addspeed);
        self.pml.velocity = vector_ma(&self.pml.velocity, accelspeed, wishdir);
    }

    fn add_currents(&self, wishvel: &mut Vec3) {
        // account for ladders
        if self.pml.ladder && self.pml.velocity[2].abs() <= 200.0 {
            let pitch = self.pm.viewangles[PITCH];
            let cmd = &self.pm.cmd;
            wishvel[2] = if pitch <= -15.0 && cmd.forwardmove > 0 {
                200.0
            } else if pitch >= 15.0 && cmd.forwardmove > 0 {
                -200.0
            } else if cmd.upmove > 0 {
                200.0
            } else if cmd.upmove < 0 {
                -200.0
            } else {
                0.0
            };

            // limit horizontal speed when on a ladder
            wishvel[0] = wishvel[0].clamp(-25.0, 25.0);
            wishvel[1] = wishvel[1].clamp(-25.0, 25.0);
        }

        // add water currents
        if self.pm.watertype & MASK_CURRENT != 0 {
            let v = current_direction(self.pm.watertype);
            let mut s = self.params.waterspeed;
            if self.pm.waterlevel == 1 && self.on_ground() {
                s /= 2.0;
            }
            *wishvel = vector_ma(wishvel, s, &v);
        }

        // add conveyor belt velocities
        if self.on_ground() {
            let v = current_direction(self.pml.groundcontents);
            *wishvel = vector_ma(wishvel, 100.0, &v);
        }
    }

    fn water_move(&mut self) {
        let cmd = self.pm.cmd;
        let fmove = cmd.forwardmove as f32;
        let smove = cmd.sidemove as f32;

        // user intentions
        let mut wishvel = [0.0; 3];
        for i in 0..3 {
            wishvel[i] = self.pml.forward[i] * fmove + self.pml.right[i] * smove;
        }

        if cmd.forwardmove == 0 && cmd.sidemove == 0 && cmd.upmove == 0 {
            wishvel[2] -= 60.0; // drift towards bottom
        } else {
            wishvel[2] += cmd.upmove as f32;
        }

        self.add_currents(&mut wishvel);

        let mut wishdir = wishvel;
        let mut wishspeed = vector_normalize(&mut wishdir);

        if wishspeed > self.params.maxspeed {
            wishspeed = self.params.maxspeed;
        }
        wishspeed *= 0.5;

        self.accelerate(&wishdir, wishspeed, self.params.wateraccelerate);

        self.step_slide_move();
    }

    fn air_move(&mut self) {
        let fmove = self.pm.cmd.forwardmove as f32;
        let smove = self.pm.cmd.sidemove as f32;

        let mut wishvel = [0.0; 3];
        for i in 0..2 {
            wishvel[i] = self.pml.forward[i] * fmove + self.pml.right[i] * smove;
        }

        self.add_currents(&mut wishvel);

        let mut wishdir = wishvel;
        let mut wishspeed = vector_normalize(&mut wishdir);

        // clamp to server defined max speed
        let maxspeed = if self.pm.s.pm_flags.contains(PmFlags::DUCKED) {
            self.params.duckspeed
        } else {
            self.params.maxspeed
        };

        if wishspeed > maxspeed {
            wishvel = vector_scale(&wishvel, maxspeed / wishspeed);
            wishspeed = maxspeed;
        }

        let gravity = self.pm.s.gravity as f32;

        if self.pml.ladder {
            self.accelerate(&wishdir, wishspeed, self.params.accelerate);
            if wishvel[2] == 0.0 {
                if self.pml.velocity[2] > 0.0 {
                    self.pml.velocity[2] = (self.pml.velocity[2] - gravity * self.pml.frametime).max(0.0);
                } else {
                    self.pml.velocity[2] = (self.pml.velocity[2] + gravity * self.pml.frametime).min(0.0);
                }
            }
            self.step_slide_move();
        } else if self.on_ground() {
            // walking on ground
            self.pml.velocity[2] = 0.0;
            self.accelerate(&wishdir, wishspeed, self.params.accelerate);

            // negative gravity fields lift the player off the ground
            if gravity > 0.0 {
                self.pml.velocity[2] = 0.0;
            } else {
                self.pml.velocity[2] -= gravity * self.pml.frametime;
            }

            if self.pml.velocity[0] == 0.0 && self.pml.velocity[1] == 0.0 {
                return;
            }
            self.step_slide_move();
        } else {
            // not on ground, so little effect on velocity
            if self.params.airaccelerate != 0.0 {
                self.air_accelerate(&wishdir, wishspeed, self.params.accelerate);
            } else {
                self.accelerate(&wishdir, wishspeed, 1.0);
            }
            // add gravity
            self.pml.velocity[2] -= gravity * self.pml.frametime;
            self.step_slide_move();
        }
    }

    fn categorize_position(&mut self) {
        // if the player hull point one quarter unit down is solid, the
        // player is on ground
        let mut point = self.pml.origin;
        point[2] -= 0.25;

        if self.pml.velocity[2] > 180.0 {
            self.pm.s.pm_flags.remove(PmFlags::ON_GROUND);
            self.pm.groundentity = None;
        } else {
            let trace = self.trace(&self.pml.origin, &point);
            self.pml.groundplane = trace.plane;
            self.pml.groundsurface = trace.surface.clone();
            self.pml.groundcontents = trace.contents;

            if trace.ent.is_none() || (trace.plane.normal[2] < MIN_STEP_NORMAL && !trace.startsolid)
            {
                self.pm.groundentity = None;
                self.pm.s.pm_flags.remove(PmFlags::ON_GROUND);
            } else {
                self.pm.groundentity = trace.ent;

                // hitting solid ground will end a waterjump
                if self.pm.s.pm_flags.contains(PmFlags::TIME_WATERJUMP) {
                    self.pm.s.pm_flags.remove(PmFlags::TIME_MASK);
                    self.pm.s.pm_time = 0;
                }

                if !self.pm.s.pm_flags.contains(PmFlags::ON_GROUND) {
                    // just hit the ground
                    self.pm.s.pm_flags.insert(PmFlags::ON_GROUND);
                    // don't do landing time if we were just going down a slope
                    if self.pml.velocity[2] < -200.0 {
                        self.pm.s.pm_flags.insert(PmFlags::TIME_LAND);
                        // don't allow another jump for a little while
                        self.pm.s.pm_time = if self.pml.velocity[2] < -400.0 { 25 } else { 18 };
                    }
                }
            }

            self.pm.add_touch(trace.ent);
        }

        // get waterlevel, accounting for ducking
        self.pm.waterlevel = 0;
        self.pm.watertype = 0;

        let sample2 = (self.pm.viewheight - self.pm.mins[2]) as i32;
        let sample1 = sample2 / 2;

        let mut point = self.pml.origin;
        point[2] += self.pm.mins[2] + 1.0;
        let cont = self.cb.pointcontents(&point);

        if cont & MASK_WATER != 0 {
            self.pm.watertype = cont;
            self.pm.waterlevel = 1;
            point[2] = self.pml.origin[2] + self.pm.mins[2] + sample1 as f32;
            if self.cb.pointcontents(&point) & MASK_WATER != 0 {
                self.pm.waterlevel = 2;
                point[2] = self.pml.origin[2] + self.pm.mins[2] + sample2 as f32;
                if self.cb.pointcontents(&point) & MASK_WATER != 0 {
                    self.pm.waterlevel = 3;
                }
            }
        }
    }

    fn check_jump(&mut self) {
        if self.pm.s.pm_flags.contains(PmFlags::TIME_LAND) {
            // hasn't been long enough since landing to jump again
            return;
        }

        if self.pm.cmd.upmove < 10 {
            // not holding jump
            self.pm.s.pm_flags.remove(PmFlags::JUMP_HELD);
            return;
        }

        // must wait for jump to be released
        if self.pm.s.pm_flags.contains(PmFlags::JUMP_HELD) {
            return;
        }

        if self.pm.s.pm_type == PmType::Dead {
            return;
        }

        if self.pm.waterlevel >= 2 {
            // swimming, not jumping
            self.pm.groundentity = None;

            if self.pml.velocity[2] <= -300.0 {
                return;
            }

            self.pml.velocity[2] = if self.pm.watertype == CONTENTS_WATER {
                100.0
            } else if self.pm.watertype == CONTENTS_SLIME {
                80.0
            } else {
                50.0
            };
            return;
        }

        if !self.on_ground() {
            return; // in air, so no effect
        }

        self.pm.s.pm_flags.insert(PmFlags::JUMP_HELD);

        self.pm.groundentity = None;
        self.pml.velocity[2] = (self.pml.velocity[2] + 270.0).max(270.0);
    }

    fn check_special_movement(&mut self) {
        if self.pm.s.pm_time != 0 {
            return;
        }

        self.pml.ladder = false;

        // check for ladder
        let mut flatforward = [self.pml.forward[0], self.pml.forward[1], 0.0];
        vector_normalize(&mut flatforward);

        let spot = vector_ma(&self.pml.origin, 1.0, &flatforward);
        let trace = self.trace(&self.pml.origin, &spot);
        if trace.fraction < 1.0 && trace.contents & CONTENTS_LADDER != 0 {
            self.pml.ladder = true;
        }

        // check for water jump
        if self.pm.waterlevel != 2 {
            return;
        }

        let mut spot = vector_ma(&self.pml.origin, 30.0, &flatforward);
        spot[2] += 4.0;
        if self.cb.pointcontents(&spot) & CONTENTS_SOLID == 0 {
            return;
        }

        spot[2] += 16.0;
        if self.cb.pointcontents(&spot) != 0 {
            return;
        }
        // jump out of water
        self.pml.velocity = vector_scale(&flatforward, 50.0);
        self.pml.velocity[2] = 350.0;

        self.pm.s.pm_flags.insert(PmFlags::TIME_WATERJUMP);
        self.pm.s.pm_time = 255;
    }

    fn fly_move(&mut self, doclip: bool) {
        self.pm.viewheight = 22.0;

        // friction
        let speed = vector_length(&self.pml.velocity);
        if speed < 1.0 {
            self.pml.velocity = VEC3_ORIGIN;
        } else {
            let friction = self.params.friction * 1.5; // extra friction
            let control = speed.max(self.params.stopspeed);
            let drop = control * friction * self.pml.frametime;
            let newspeed = (speed - drop).max(0.0) / speed;
            self.pml.velocity = vector_scale(&self.pml.velocity, newspeed);
        }

        // accelerate
        let fmove = self.pm.cmd.forwardmove as f32;
        let smove = self.pm.cmd.sidemove as f32;

        vector_normalize(&mut self.pml.forward);
        vector_normalize(&mut self.pml.right);

        let mut wishvel = [0.0; 3];
        for i in 0..3 {
            wishvel[i] = self.pml.forward[i] * fmove + self.pml.right[i] * smove;
        }
        wishvel[2] += self.pm.cmd.upmove as f32;

        let mut wishdir = wishvel;
        let wishspeed = vector_normalize(&mut wishdir).min(self.params.maxspeed);

        let currentspeed = dot_product(&self.pml.velocity, &wishdir);
        let addspeed = wishspeed - currentspeed;
        if addspeed <= 0.0 {
            return;
        }
        let accelspeed = (self.params.accelerate * self.pml.frametime * wishspeed).min(addspeed);
        self.pml.velocity = vector_ma(&self.pml.velocity, accelspeed, &wishdir);

        // move
        let end = vector_ma(&self.pml.origin, self.pml.frametime, &self.pml.velocity);
        if doclip {
            self.pml.origin = self.trace(&self.pml.origin, &end).endpos;
        } else {
            self.pml.origin = end;
        }
    }

    /// Sets mins, maxs, and viewheight.
    fn check_duck(&mut self) {
        self.pm.mins[0] = -16.0;
        self.pm.mins[1] = -16.0;
        self.pm.maxs[0] = 16.0;
        self.pm.maxs[1] = 16.0;

        if self.pm.s.pm_type == PmType::Gib {
            self.pm.mins[2] = 0.0;
            self.pm.maxs[2] = 16.0;
            self.pm.viewheight = 8.0;
            return;
        }

        self.pm.mins[2] = -24.0;

        if self.pm.s.pm_type == PmType::Dead {
            self.pm.s.pm_flags.insert(PmFlags::DUCKED);
        } else if self.pm.cmd.upmove < 0 && self.pm.s.pm_flags.contains(PmFlags::ON_GROUND) {
            // duck
            self.pm.s.pm_flags.insert(PmFlags::DUCKED);
        } else if self.pm.s.pm_flags.contains(PmFlags::DUCKED) {
            // try to stand up
            self.pm.maxs[2] = 32.0;
            let trace = self.trace(&self.pml.origin, &self.pml.origin);
            if !trace.allsolid {
                self.pm.s.pm_flags.remove(PmFlags::DUCKED);
            }
        }

        if self.pm.s.pm_flags.contains(PmFlags::DUCKED) {
            self.pm.maxs[2] = 4.0;
            self.pm.viewheight = -2.0;
        } else {
            self.pm.maxs[2] = 32.0;
            self.pm.viewheight = 22.0;
        }
    }

    fn dead_move(&mut self) {
        if !self.on_ground() {
            return;
        }

        // extra friction
        let forward = vector_length(&self.pml.velocity) - 20.0;
        if forward <= 0.0 {
            self.pml.velocity = VEC3_ORIGIN;
        } else {
            vector_normalize(&mut self.pml.velocity);
            self.pml.velocity = vector_scale(&self.pml.velocity, forward);
        }
    }

    fn good_position(&self) -> bool {
        if self.pm.s.pm_type == PmType::Spectator {
            return true;
        }
        let origin = self.pm.s.origin_f();
        !self.trace(&origin, &origin).allsolid
    }

    /// On exit, the origin will have a value that is pre-quantized to the
    /// 0.125 precision of the network channel and in a valid position.
    fn snap_position(&mut self) {
        // try all single bits first
        const JITTERBITS: [usize; 8] = [0, 4, 1, 2, 3, 5, 6, 7];

        // snap velocity to eigths
        for i in 0..3 {
            self.pm.s.velocity[i] = (self.pml.velocity[i] * 8.0) as i16;
        }

        let mut sign = [0i16; 3];
        for i in 0..3 {
            sign[i] = if self.pml.origin[i] >= 0.0 { 1 } else { -1 };
            self.pm.s.origin[i] = (self.pml.origin[i] * 8.0) as i16;
            if self.pm.s.origin[i] as f32 * 0.125 == self.pml.origin[i] {
                sign[i] = 0;
            }
        }
        let base = self.pm.s.origin;

        // try all combinations
        for bits in JITTERBITS {
            self.pm.s.origin = base;
            for i in 0..3 {
                if bits & (1 << i) != 0 {
                    self.pm.s.origin[i] = self.pm.s.origin[i].wrapping_add(sign[i]);
                }
            }
            if self.good_position() {
                return;
            }
        }

        // go back to the last position
        self.pm.s.origin = self.pml.previous_origin;
    }

    fn initial_snap_position(&mut self) {
        const OFFSET: [i16; 3] = [0, -1, 1];

        let base = self.pm.s.origin;

        for oz in OFFSET {
            self.pm.s.origin[2] = base[2].wrapping_add(oz);
            for oy in OFFSET {
                self.pm.s.origin[1] = base[1].wrapping_add(oy);
                for ox in OFFSET {
                    self.pm.s.origin[0] = base[0].wrapping_add(ox);
                    if self.good_position() {
                        self.pml.origin = self.pm.s.origin_f();
                        self.pml.previous_origin = self.pm.s.origin;
                        return;
                    }
                }
            }
        }

        self.pm.s.origin = base;
        log::debug!("bad initial snap position at {:?}", base);
    }

    fn clamp_angles(&mut self) {
        let cmd = &self.pm.cmd;
        let delta = &self.pm.s.delta_angles;
        if self.pm.s.pm_flags.contains(PmFlags::TIME_TELEPORT) {
            self.pm.viewangles[YAW] = short2angle(cmd.angles[YAW].wrapping_add(delta[YAW]));
            self.pm.viewangles[PITCH] = 0.0;
            self.pm.viewangles[ROLL] = 0.0;
        } else {
            // circularly clamp the angles with deltas
            for i in 0..3 {
                self.pm.viewangles[i] = short2angle(cmd.angles[i].wrapping_add(delta[i]));
            }

            // don't let the player look up or down more than 90 degrees
            let pitch = self.pm.viewangles[PITCH];
            if pitch > 89.0 && pitch < 180.0 {
                self.pm.viewangles[PITCH] = 89.0;
            } else if pitch < 271.0 && pitch >= 180.0 {
                self.pm.viewangles[PITCH] = 271.0;
            }
        }
        (self.pml.forward, self.pml.right, self.pml.up) = angle_vectors(&self.pm.viewangles);
    }

    fn execute(&mut self) {
        // clear results
        self.pm.numtouch = 0;
        self.pm.viewangles = [0.0; 3];
        self.pm.viewheight = 0.0;
        self.pm.groundentity = None;
        self.pm.watertype = 0;
        self.pm.waterlevel = 0;

        // clear all pmove local vars
        self.pml = PmLocal {
            // convert origin and velocity to float values
            origin: self.pm.s.origin_f(),
            velocity: self.pm.s.velocity_f(),
            // save old org in case we get stuck
            previous_origin: self.pm.s.origin,
            frametime: self.pm.cmd.msec as f32 * 0.001,
            ..PmLocal::default()
        };

        self.clamp_angles();

        if self.pm.s.pm_type == PmType::Spectator {
            self.fly_move(false);
            self.snap_position();
            return;
        }

        if self.pm.s.pm_type >= PmType::Dead {
            self.pm.cmd.forwardmove = 0;
            self.pm.cmd.sidemove = 0;
            self.pm.cmd.upmove = 0;
        }

        if self.pm.s.pm_type == PmType::Freeze {
            return; // no movement at all
        }

        // set mins, maxs, and viewheight
        self.check_duck();

        if self.pm.snapinitial {
            self.initial_snap_position();
        }

        // set groundentity, watertype, and waterlevel
        self.categorize_position();

        if self.pm.s.pm_type == PmType::Dead {
            self.dead_move();
        }

        self.check_special_movement();

        // drop timing counter
        if self.pm.s.pm_time != 0 {
            let msec = (self.pm.cmd.msec >> 3).max(1);
            if msec >= self.pm.s.pm_time {
                self.pm.s.pm_flags.remove(PmFlags::TIME_MASK);
                self.pm.s.pm_time = 0;
            } else {
                self.pm.s.pm_time -= msec;
            }
        }

        if self.pm.s.pm_flags.contains(PmFlags::TIME_TELEPORT) {
            // teleport pause stays exactly in place
        } else if self.pm.s.pm_flags.contains(PmFlags::TIME_WATERJUMP) {
            // waterjump has no control, but falls
            self.pml.velocity[2] -= self.pm.s.gravity as f32 * self.pml.frametime;
            if self.pml.velocity[2] < 0.0 {
                // cancel as soon as we are falling down again
                self.pm.s.pm_flags.remove(PmFlags::TIME_MASK);
                self.pm.s.pm_time = 0;
            }

            self.step_slide_move();
        } else {
            self.check_jump();

            self.friction();

            if self.pm.waterlevel >= 2 {
                self.water_move();
            } else {
                let mut angles = self.pm.viewangles;
                if angles[PITCH] > 180.0 {
                    angles[PITCH] -= 360.0;
                }
                angles[PITCH] /= 3.0;

                (self.pml.forward, self.pml.right, self.pml.up) = angle_vectors(&angles);

                self.air_move();
            }
        }

        // set groundentity, watertype, and waterlevel for final spot
        self.categorize_position();

        self.snap_position();
    }
}

/// Runs one movement step. Can be called by either the server or the
/// client; identical inputs always produce identical outputs.
pub fn pmove(pm: &mut PmoveData, params: &PmoveParams, callbacks: &impl PmoveCallbacks) {
    let mut ctx = PmoveContext {
        pm,
        pml: PmLocal::default(),
        params,
        cb: callbacks,
    };
    ctx.execute();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::q_shared::{vector_subtract, PmoveState, UserCmd, MAXTOUCH};
    use pretty_assertions::assert_eq;

    const DIST_EPSILON: f32 = 0.03125;

    /// Axis-aligned solid boxes, clipped the same way brushes are.
    struct BoxWorld {
        solids: Vec<(Vec3, Vec3, i32)>,
        water_below: Option<f32>,
    }

    impl BoxWorld {
        fn floor() -> Self {
            Self {
                solids: vec![([-4096.0, -4096.0, -64.0], [4096.0, 4096.0, 0.0], CONTENTS_SOLID)],
                water_below: None,
            }
        }

        fn with(mut self, mins: Vec3, maxs: Vec3, contents: i32) -> Self {
            self.solids.push((mins, maxs, contents));
            self
        }
    }

    impl PmoveCallbacks for BoxWorld {
        fn trace(&self, start: &Vec3, mins: &Vec3, maxs: &Vec3, end: &Vec3) -> Trace {
            let mut best = Trace {
                endpos: *end,
                ..Trace::default()
            };

            for (ent, (bmins, bmaxs, contents)) in self.solids.iter().enumerate() {
                let mut planes = Vec::with_capacity(6);
                for axis in 0..3 {
                    let mut n = [0.0; 3];
                    n[axis] = 1.0;
                    planes.push((n, bmaxs[axis] - mins[axis]));
                    n[axis] = -1.0;
                    planes.push((n, -(bmins[axis] - maxs[axis])));
                }

                let mut enterfrac = -1.0f32;
                let mut leavefrac = 1.0f32;
                let mut clip = None;
                let (mut getout, mut startout, mut miss) = (false, false, false);
                for (n, dist) in &planes {
                    let d1 = dot_product(start, n) - dist;
                    let d2 = dot_product(end, n) - dist;
                    if d2 > 0.0 {
                        getout = true;
                    }
                    if d1 > 0.0 {
                        startout = true;
                    }
                    if d1 > 0.0 && d2 >= d1 {
                        miss = true;
                        break;
                    }
                    if d1 <= 0.0 && d2 <= 0.0 {
                        continue;
                    }
                    if d1 > d2 {
                        let f = (d1 - DIST_EPSILON) / (d1 - d2);
                        if f > enterfrac {
                            enterfrac = f;
                            clip = Some(*n);
                        }
                    } else {
                        let f = (d1 + DIST_EPSILON) / (d1 - d2);
                        leavefrac = leavefrac.min(f);
                    }
                }
                if miss {
                    continue;
                }
                if !startout {
                    best.startsolid = true;
                    best.ent = Some(ent);
                    if !getout {
                        best.allsolid = true;
                        best.fraction = 0.0;
                        best.endpos = *start;
                    }
                    continue;
                }
                if enterfrac < leavefrac && enterfrac > -1.0 && enterfrac < best.fraction {
                    best.fraction = enterfrac.max(0.0);
                    best.plane = CPlane::new(clip.unwrap_or_default(), 0.0, 0);
                    best.surface = Some(CSurface::default());
                    best.contents = *contents;
                    best.ent = Some(ent);
                }
            }

            if best.fraction < 1.0 && !best.allsolid {
                best.endpos = vector_ma(start, best.fraction, &vector_subtract(end, start));
            }
            best
        }

        fn pointcontents(&self, p: &Vec3) -> i32 {
            let mut c = 0;
            for (mins, maxs, contents) in &self.solids {
                if (0..3).all(|i| p[i] > mins[i] && p[i] < maxs[i]) {
                    c |= contents;
                }
            }
            if self.water_below.is_some_and(|z| p[2] < z) {
                c |= CONTENTS_WATER;
            }
            c
        }
    }

    /// Standing on the floor: origin z = 24.125 in network units.
    fn standing_player() -> PmoveData {
        PmoveData {
            s: PmoveState {
                origin: [0, 0, 193],
                gravity: 800,
                pm_flags: PmFlags::ON_GROUND,
                ..PmoveState::default()
            },
            ..PmoveData::default()
        }
    }

    fn run_forward(world: &BoxWorld, frames: usize) -> PmoveData {
        let params = PmoveParams::default();
        let mut pm = standing_player();
        for _ in 0..frames {
            pm.cmd = UserCmd {
                msec: 50,
                forwardmove: 400,
                ..UserCmd::default()
            };
            pmove(&mut pm, &params, world);
        }
        pm
    }

    #[test]
    fn test_clip_velocity() {
        let out = clip_velocity(&[10.0, 0.0, -10.0], &[0.0, 0.0, 1.0], 1.0);
        assert_eq!(out, [10.0, 0.0, 0.0]);
    }

    #[test]
    fn test_clip_velocity_overbounce() {
        let out = clip_velocity(&[0.0, 0.0, -100.0], &[0.0, 0.0, 1.0], OVERCLIP);
        // -100 - (-100 * 1.01) = 1.0
        assert!((out[2] - 1.0).abs() < 0.01);
    }

    #[test]
    fn test_clip_velocity_stop_epsilon() {
        let out = clip_velocity(&[0.05, 5.0, -0.09], &[1.0, 0.0, 0.0], 0.0);
        assert_eq!(out, [0.0, 5.0, 0.0]);
    }

    #[test]
    fn test_params_from_cvars() {
        let mut cvars = CvarContext::new();
        assert_eq!(PmoveParams::from_cvars(&cvars), PmoveParams::default());

        cvars.register_pmove_cvars();
        cvars.set("pm_maxspeed", "320");
        cvars.set("pm_airaccelerate", "1");
        let params = PmoveParams::from_cvars(&cvars);
        assert_eq!(params.maxspeed, 320.0);
        assert_eq!(params.airaccelerate, 1.0);
        assert_eq!(params.friction, 6.0);
    }

    #[test]
    fn test_standing_still_stays_put() {
        let world = BoxWorld::floor();
        let mut pm = standing_player();
        pm.cmd.msec = 50;
        pmove(&mut pm, &PmoveParams::default(), &world);
        assert_eq!(pm.s.origin, [0, 0, 193]);
        assert_eq!(pm.s.velocity, [0, 0, 0]);
        assert_eq!(pm.groundentity, Some(0));
        assert!(pm.s.pm_flags.contains(PmFlags::ON_GROUND));
        assert_eq!(pm.mins, [-16.0, -16.0, -24.0]);
        assert_eq!(pm.maxs, [16.0, 16.0, 32.0]);
        assert_eq!(pm.viewheight, 22.0);
    }

    #[test]
    fn test_small_step_is_climbed() {
        let world = BoxWorld::floor().with([32.0, -4096.0, -64.0], [4096.0, 4096.0, 1.0], CONTENTS_SOLID);
        let pm = run_forward(&world, 20);
        let origin = pm.s.origin_f();
        assert!(origin[0] > 64.0, "{:?}", origin);
        assert!(origin[2] > 24.9 && origin[2] < 25.3, "{:?}", origin);
        assert!(pm.groundentity.is_some());
    }

    #[test]
    fn test_tall_wall_blocks() {
        let world = BoxWorld::floor().with([32.0, -4096.0, -64.0], [4096.0, 4096.0, 24.0], CONTENTS_SOLID);
        let pm = run_forward(&world, 20);
        let origin = pm.s.origin_f();
        assert!(origin[0] <= 16.0 && origin[0] > 15.0, "{:?}", origin);
        assert!(origin[2] < 25.0, "{:?}", origin);
        assert!(pm.touched().contains(&1));
    }

    #[test]
    fn test_pmove_is_deterministic() {
        let world = BoxWorld::floor().with([32.0, 16.0, -64.0], [4096.0, 4096.0, 10.0], CONTENTS_SOLID);
        let params = PmoveParams::default();
        let mut a = standing_player();
        a.cmd = UserCmd {
            msec: 40,
            forwardmove: 300,
            sidemove: -200,
            upmove: 200,
            angles: [0, 3000, 0],
            ..UserCmd::default()
        };
        let mut b = a.clone();
        pmove(&mut a, &params, &world);
        pmove(&mut b, &params, &world);
        assert_eq!(a, b);
    }

    #[test]
    fn test_snap_keeps_grid_origin() {
        let world = BoxWorld::floor();
        let params = PmoveParams::default();
        let mut pm = standing_player();
        pm.s.origin = [801, -17, 193];
        let mut ctx = PmoveContext {
            pm: &mut pm,
            pml: PmLocal::default(),
            params: &params,
            cb: &world,
        };
        ctx.check_duck();
        ctx.pml.origin = [100.125, -2.125, 24.125];
        ctx.snap_position();
        assert_eq!(pm.s.origin, [801, -17, 193]);
    }

    #[test]
    fn test_snap_nudges_out_of_floor() {
        let world = BoxWorld::floor();
        let params = PmoveParams::default();
        let mut pm = standing_player();
        let mut ctx = PmoveContext {
            pm: &mut pm,
            pml: PmLocal::default(),
            params: &params,
            cb: &world,
        };
        ctx.check_duck();
        // exactly on the floor plane counts as inside
        ctx.pml.origin = [0.0, 0.0, 24.03];
        ctx.snap_position();
        assert_eq!(pm.s.origin, [0, 0, 193]);
    }

    #[test]
    fn test_initial_snap_finds_free_spot() {
        let world = BoxWorld::floor();
        let mut pm = standing_player();
        pm.s.origin = [0, 0, 192];
        pm.snapinitial = true;
        pm.cmd.msec = 10;
        pmove(&mut pm, &PmoveParams::default(), &world);
        assert_eq!(pm.s.origin, [0, 0, 193]);
    }

    #[test]
    fn test_freeze_no_movement() {
        let world = BoxWorld::floor();
        let mut pm = standing_player();
        pm.s.pm_type = PmType::Freeze;
        pm.s.origin = [800, 800, 800];
        pm.cmd.msec = 16;
        pm.cmd.forwardmove = 127;
        pmove(&mut pm, &PmoveParams::default(), &world);
        assert_eq!(pm.s.origin, [800, 800, 800]);
    }

    #[test]
    fn test_spectator_flies_through_walls() {
        let world = BoxWorld::floor().with([8.0, -64.0, 0.0], [12.0, 64.0, 256.0], CONTENTS_SOLID);
        let mut pm = standing_player();
        pm.s.pm_type = PmType::Spectator;
        pm.s.origin = [0, 0, 800];
        for _ in 0..10 {
            pm.cmd = UserCmd {
                msec: 50,
                forwardmove: 400,
                ..UserCmd::default()
            };
            pmove(&mut pm, &PmoveParams::default(), &world);
        }
        assert!(pm.s.origin_f()[0] > 12.0);
        assert_eq!(pm.s.origin[2], 800);
    }

    #[test]
    fn test_falling_lands_on_floor() {
        let world = BoxWorld::floor();
        let params = PmoveParams::default();
        let mut pm = standing_player();
        pm.s.pm_flags = PmFlags::empty();
        pm.s.origin = [0, 0, 8 * 200];
        for _ in 0..40 {
            pm.cmd = UserCmd {
                msec: 25,
                ..UserCmd::default()
            };
            pmove(&mut pm, &params, &world);
        }
        assert_eq!(pm.s.origin, [0, 0, 193]);
        assert_eq!(pm.groundentity, Some(0));
        assert!(pm.s.pm_flags.contains(PmFlags::ON_GROUND));
    }

    #[test]
    fn test_jump_from_ground() {
        let world = BoxWorld::floor();
        let mut pm = standing_player();
        pm.cmd = UserCmd {
            msec: 25,
            upmove: 200,
            ..UserCmd::default()
        };
        pmove(&mut pm, &PmoveParams::default(), &world);
        assert!(pm.s.pm_flags.contains(PmFlags::JUMP_HELD));
        assert!(pm.s.velocity_f()[2] > 200.0);
        assert_eq!(pm.groundentity, None);
    }

    #[test]
    fn test_ducking_shrinks_box() {
        let world = BoxWorld::floor();
        let mut pm = standing_player();
        pm.cmd = UserCmd {
            msec: 25,
            upmove: -200,
            ..UserCmd::default()
        };
        pmove(&mut pm, &PmoveParams::default(), &world);
        assert!(pm.s.pm_flags.contains(PmFlags::DUCKED));
        assert_eq!(pm.maxs[2], 4.0);
        assert_eq!(pm.viewheight, -2.0);
    }

    #[test]
    fn test_dead_ignores_input_and_gib_box() {
        let world = BoxWorld::floor();
        let mut pm = standing_player();
        pm.s.pm_type = PmType::Dead;
        pm.cmd = UserCmd {
            msec: 50,
            forwardmove: 400,
            ..UserCmd::default()
        };
        pmove(&mut pm, &PmoveParams::default(), &world);
        assert_eq!(pm.s.origin[0], 0);
        assert!(pm.s.pm_flags.contains(PmFlags::DUCKED));

        pm.s.pm_type = PmType::Gib;
        pmove(&mut pm, &PmoveParams::default(), &world);
        assert_eq!(pm.mins[2], 0.0);
        assert_eq!(pm.maxs[2], 16.0);
        assert_eq!(pm.viewheight, 8.0);
    }

    #[test]
    fn test_waterlevel() {
        let mut world = BoxWorld::floor();
        world.water_below = Some(100.0);
        let mut pm = standing_player();
        pm.cmd.msec = 25;
        pmove(&mut pm, &PmoveParams::default(), &world);
        assert_eq!(pm.waterlevel, 3);
        assert_eq!(pm.watertype, CONTENTS_WATER);

        world.water_below = Some(10.0);
        let mut pm = standing_player();
        pm.cmd.msec = 25;
        pmove(&mut pm, &PmoveParams::default(), &world);
        assert_eq!(pm.waterlevel, 1);
    }

    #[test]
    fn test_touch_list_is_capped() {
        let mut pm = PmoveData::default();
        for i in 0..MAXTOUCH + 5 {
            pm.add_touch(Some(i));
        }
        pm.add_touch(None);
        assert_eq!(pm.numtouch, MAXTOUCH);
        assert_eq!(pm.touched()[MAXTOUCH - 1], MAXTOUCH - 1);
    }

    #[test]
    fn test_ladder_climb_when_looking_up() {
        let world = BoxWorld::floor().with(
            [17.0, -64.0, 0.0],
            [20.0, 64.0, 256.0],
            CONTENTS_LADDER | CONTENTS_SOLID,
        );
        let mut pm = standing_player();
        pm.cmd = UserCmd {
            msec: 50,
            forwardmove: 400,
            // about 30 degrees up
            angles: [-5461, 0, 0],
            ..UserCmd::default()
        };
        pmove(&mut pm, &PmoveParams::default(), &world);
        assert!(pm.s.velocity_f()[2] > 0.0);
        assert!(pm.s.origin[2] > 193);
        assert!(pm.s.origin_f()[0] < 1.0);
    }
}
