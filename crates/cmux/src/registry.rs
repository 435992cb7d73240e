//! Fixed-capacity table of established user channels

use cmux_protocol::Dlci;

use crate::channel::ChannelIo;

/// Completion callback bound to a channel
pub type ChannelCallback = Box<dyn FnMut(&mut ChannelIo<'_>) + Send>;

struct Slot {
    dlci: Dlci,
    callback: Option<ChannelCallback>,
}

/// Slots are filled in establishment order and never released
pub(crate) struct ChannelRegistry {
    slots: Vec<Option<Slot>>,
}

impl ChannelRegistry {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| None).collect(),
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.slots.len()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    pub(crate) fn is_full(&self) -> bool {
        self.slots.iter().all(Option::is_some)
    }

    /// Index of the slot bound to `dlci`
    pub(crate) fn slot_of(&self, dlci: Dlci) -> Option<usize> {
        self.slots
            .iter()
            .position(|slot| matches!(slot, Some(s) if s.dlci == dlci))
    }

    pub(crate) fn is_in_use(&self, dlci: Dlci) -> bool {
        self.slot_of(dlci).is_some()
    }

    pub(crate) fn dlci_at(&self, index: usize) -> Option<Dlci> {
        self.slots.get(index)?.as_ref().map(|slot| slot.dlci)
    }

    /// Bind `dlci` to the first free slot
    ///
    /// Panics if the registry is full or `dlci` is already bound; callers
    /// check both before starting an establishment.
    pub(crate) fn append(&mut self, dlci: Dlci) -> usize {
        assert!(
            !self.is_in_use(dlci),
            "DLCI {} already bound to a channel slot",
            dlci
        );
        let index = self
            .slots
            .iter()
            .position(Option::is_none)
            .unwrap_or_else(|| panic!("no free channel slot for DLCI {}", dlci));
        self.slots[index] = Some(Slot {
            dlci,
            callback: None,
        });
        index
    }

    /// Established DLCIs in slot order
    pub(crate) fn dlcis(&self) -> impl Iterator<Item = Dlci> + '_ {
        self.slots.iter().flatten().map(|slot| slot.dlci)
    }

    /// Replace the callback of an established channel
    pub(crate) fn set_callback(&mut self, dlci: Dlci, callback: ChannelCallback) -> bool {
        match self.slot_mut(dlci) {
            Some(slot) => {
                slot.callback = Some(callback);
                true
            }
            None => false,
        }
    }

    /// Take the callback out while it runs
    pub(crate) fn take_callback(&mut self, dlci: Dlci) -> Option<ChannelCallback> {
        self.slot_mut(dlci)?.callback.take()
    }

    /// Put a callback back unless it was replaced in the meantime
    pub(crate) fn restore_callback(&mut self, dlci: Dlci, callback: ChannelCallback) {
        if let Some(slot) = self.slot_mut(dlci) {
            slot.callback.get_or_insert(callback);
        }
    }

    fn slot_mut(&mut self, dlci: Dlci) -> Option<&mut Slot> {
        self.slots.iter_mut().flatten().find(|slot| slot.dlci == dlci)
    }
}
