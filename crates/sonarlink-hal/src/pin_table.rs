//! [`PinTable`] – which pins are bound to which sonar callback.
//!
//! Shared by every [`BridgeConnection`][crate::bridge::BridgeConnection]
//! implementation so the "no two sensors ever share a pin" rule is enforced
//! identically on real and simulated hardware.

use std::collections::HashMap;

use sonarlink_types::SonarError;

use crate::bridge::ReadingCallback;

struct Binding {
    echo_pin: u8,
    callback: ReadingCallback,
}

/// Bindings keyed by trigger pin.
#[derive(Default)]
pub struct PinTable {
    bindings: HashMap<u8, Binding>,
}

impl PinTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `trigger_pin`/`echo_pin` to `callback`.
    ///
    /// # Errors
    ///
    /// Returns [`SonarError::PinConflict`] if the two pins are equal or if
    /// either is already used (as trigger or echo) by an existing binding.
    pub fn bind(
        &mut self,
        trigger_pin: u8,
        echo_pin: u8,
        callback: ReadingCallback,
    ) -> Result<(), SonarError> {
        if trigger_pin == echo_pin {
            return Err(SonarError::PinConflict {
                trigger_pin,
                echo_pin,
                details: "trigger and echo must be different pins".to_string(),
            });
        }
        for pin in [trigger_pin, echo_pin] {
            if let Some(owner) = self.owner_of(pin) {
                return Err(SonarError::PinConflict {
                    trigger_pin,
                    echo_pin,
                    details: format!("pin {pin} is already bound to the sonar on trigger {owner}"),
                });
            }
        }
        self.bindings.insert(
            trigger_pin,
            Binding {
                echo_pin,
                callback,
            },
        );
        Ok(())
    }

    /// Remove the binding on `trigger_pin`.  Returns `true` if one existed.
    pub fn release(&mut self, trigger_pin: u8) -> bool {
        self.bindings.remove(&trigger_pin).is_some()
    }

    /// Callback registered for `trigger_pin`, if any.
    pub fn callback(&self, trigger_pin: u8) -> Option<ReadingCallback> {
        self.bindings
            .get(&trigger_pin)
            .map(|binding| binding.callback.clone())
    }

    pub fn is_bound(&self, trigger_pin: u8) -> bool {
        self.bindings.contains_key(&trigger_pin)
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    pub fn clear(&mut self) {
        self.bindings.clear();
    }

    // Trigger pin of the binding that uses `pin` on either side.
    fn owner_of(&self, pin: u8) -> Option<u8> {
        self.bindings
            .iter()
            .find(|(trigger, binding)| **trigger == pin || binding.echo_pin == pin)
            .map(|(trigger, _)| *trigger)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn noop() -> ReadingCallback {
        Arc::new(|_| {})
    }

    #[test]
    fn bind_and_release() {
        let mut table = PinTable::new();
        table.bind(2, 8, noop()).unwrap();
        assert!(table.is_bound(2));
        assert_eq!(table.len(), 1);

        assert!(table.release(2));
        assert!(!table.release(2));
        assert!(table.is_empty());
    }

    #[test]
    fn trigger_reused_as_echo_conflicts() {
        let mut table = PinTable::new();
        table.bind(2, 8, noop()).unwrap();
        let err = table.bind(3, 2, noop()).unwrap_err();
        assert!(matches!(err, SonarError::PinConflict { trigger_pin: 3, echo_pin: 2, .. }));
    }

    #[test]
    fn echo_reused_as_trigger_conflicts() {
        let mut table = PinTable::new();
        table.bind(2, 8, noop()).unwrap();
        assert!(table.bind(8, 9, noop()).is_err());
        // The failed bind must not disturb the existing one.
        assert!(table.is_bound(2));
        assert!(!table.is_bound(8));
    }

    #[test]
    fn identical_pins_conflict() {
        let mut table = PinTable::new();
        assert!(table.bind(5, 5, noop()).is_err());
    }

    #[test]
    fn released_pins_can_be_rebound() {
        let mut table = PinTable::new();
        table.bind(4, 10, noop()).unwrap();
        table.release(4);
        table.bind(10, 4, noop()).unwrap();
        assert!(table.is_bound(10));
    }

    #[test]
    fn callback_lookup_is_per_trigger() {
        let mut table = PinTable::new();
        table.bind(2, 8, noop()).unwrap();
        assert!(table.callback(2).is_some());
        assert!(table.callback(8).is_none());
    }
}
