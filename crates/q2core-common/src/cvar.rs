// cvar.rs -- named tuning variables read by movement and area queries

use bitflags::bitflags;
use std::collections::HashMap;

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct CvarFlags: u32 {
        /// written to the config on shutdown
        const ARCHIVE = 1;
        /// can't be changed from outside the engine
        const NOSET   = 8;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Cvar {
    pub name: String,
    pub string: String,
    pub flags: CvarFlags,
    pub modified: bool,
    pub value: f32,
}

/// Movement tuning registered by `register_pmove_cvars`, with defaults.
pub const PMOVE_CVARS: &[(&str, &str)] = &[
    ("pm_stopspeed", "100"),
    ("pm_maxspeed", "300"),
    ("pm_duckspeed", "100"),
    ("pm_accelerate", "10"),
    ("pm_airaccelerate", "0"),
    ("pm_wateraccelerate", "10"),
    ("pm_friction", "6"),
    ("pm_waterfriction", "1"),
    ("pm_waterspeed", "400"),
];

/// The variable store. Lookup by name is O(1).
#[derive(Debug, Default)]
pub struct CvarContext {
    pub cvar_vars: Vec<Cvar>,
    cvar_index: HashMap<String, usize>,
}

fn parse_value(s: &str) -> f32 {
    s.trim().parse::<f32>().unwrap_or(0.0)
}

impl CvarContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store with the movement and area variables registered.
    pub fn with_engine_defaults() -> Self {
        let mut ctx = Self::new();
        ctx.register_pmove_cvars();
        ctx.get("map_noareas", "0", CvarFlags::empty());
        ctx
    }

    pub fn register_pmove_cvars(&mut self) {
        for &(name, value) in PMOVE_CVARS {
            self.get(name, value, CvarFlags::empty());
        }
    }

    pub fn find_var(&self, name: &str) -> Option<&Cvar> {
        self.cvar_index.get(name).map(|&idx| &self.cvar_vars[idx])
    }

    /// Float value, 0 when the variable does not exist.
    pub fn variable_value(&self, name: &str) -> f32 {
        self.find_var(name).map_or(0.0, |var| var.value)
    }

    pub fn variable_string(&self, name: &str) -> &str {
        self.find_var(name).map_or("", |var| var.string.as_str())
    }

    /// Get or create. An existing variable keeps its value; flags are OR'd in.
    pub fn get(&mut self, name: &str, value: &str, flags: CvarFlags) -> usize {
        if let Some(&idx) = self.cvar_index.get(name) {
            self.cvar_vars[idx].flags |= flags;
            return idx;
        }

        let idx = self.cvar_vars.len();
        self.cvar_vars.push(Cvar {
            name: name.to_string(),
            string: value.to_string(),
            flags,
            modified: true,
            value: parse_value(value),
        });
        self.cvar_index.insert(name.to_string(), idx);
        idx
    }

    /// Set a value, creating the variable if needed. NOSET variables are
    /// left alone.
    pub fn set(&mut self, name: &str, value: &str) -> usize {
        let Some(&idx) = self.cvar_index.get(name) else {
            return self.get(name, value, CvarFlags::empty());
        };
        let var = &mut self.cvar_vars[idx];

        if var.flags.contains(CvarFlags::NOSET) {
            log::warn!("{} is write protected", name);
            return idx;
        }
        if var.string == value {
            return idx;
        }
        var.modified = true;
        var.string = value.to_string();
        var.value = parse_value(value);
        idx
    }

    pub fn set_value(&mut self, name: &str, value: f32) -> usize {
        let s = if value == (value as i32) as f32 {
            format!("{}", value as i32)
        } else {
            format!("{}", value)
        };
        self.set(name, &s)
    }

    pub fn modified(&self, name: &str) -> bool {
        self.find_var(name).is_some_and(|var| var.modified)
    }

    /// Returns the previous modified flag and clears it.
    pub fn take_modified(&mut self, name: &str) -> bool {
        match self.cvar_index.get(name) {
            Some(&idx) => std::mem::replace(&mut self.cvar_vars[idx].modified, false),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cvar_get_and_find() {
        let mut ctx = CvarContext::new();
        ctx.get("test_var", "42", CvarFlags::empty());
        assert_eq!(ctx.variable_value("test_var"), 42.0);
        assert_eq!(ctx.variable_string("test_var"), "42");
    }

    #[test]
    fn test_cvar_get_creates_once() {
        let mut ctx = CvarContext::new();
        let a = ctx.get("test", "1", CvarFlags::empty());
        let b = ctx.get("test", "2", CvarFlags::ARCHIVE);
        assert_eq!(a, b);
        assert_eq!(ctx.variable_string("test"), "1");
        assert!(ctx.find_var("test").unwrap().flags.contains(CvarFlags::ARCHIVE));
    }

    #[test]
    fn test_cvar_noset() {
        let mut ctx = CvarContext::new();
        ctx.get("test_var", "10", CvarFlags::NOSET);
        ctx.set("test_var", "20");
        assert_eq!(ctx.variable_value("test_var"), 10.0);
        assert_eq!(ctx.variable_string("test_var"), "10");
    }

    #[test]
    fn test_cvar_set_creates_missing() {
        let mut ctx = CvarContext::new();
        ctx.set("map_noareas", "1");
        assert_eq!(ctx.variable_value("map_noareas"), 1.0);
    }

    #[test]
    fn test_cvar_set_value_and_modified() {
        let mut ctx = CvarContext::with_engine_defaults();
        assert!(ctx.take_modified("pm_maxspeed"));
        assert!(!ctx.modified("pm_maxspeed"));

        ctx.set_value("pm_maxspeed", 320.0);
        assert_eq!(ctx.variable_string("pm_maxspeed"), "320");
        assert!(ctx.modified("pm_maxspeed"));

        ctx.set_value("pm_friction", 4.5);
        assert!((ctx.variable_value("pm_friction") - 4.5).abs() < 1e-6);
    }

    #[test]
    fn test_engine_defaults() {
        let ctx = CvarContext::with_engine_defaults();
        assert_eq!(ctx.variable_value("pm_stopspeed"), 100.0);
        assert_eq!(ctx.variable_value("pm_airaccelerate"), 0.0);
        assert_eq!(ctx.variable_value("pm_waterspeed"), 400.0);
        assert_eq!(ctx.variable_value("map_noareas"), 0.0);
        assert_eq!(ctx.variable_value("nonexistent"), 0.0);
        assert_eq!(ctx.variable_string("nonexistent"), "");
    }
}
