//! `epoll_create1`/`epoll_ctl`/`epoll_pwait` bookkeeping (spec.md §4.9). Each
//! epoll instance is its own guest fd, entered into the VFS fd table as an
//! anonymous fifo-typed handle so it consumes a normal fd number and closes
//! through the ordinary `close` path; the watch list itself lives here,
//! keyed by that fd.

use std::collections::BTreeMap;

use crate::flags::EpollEvents;

#[derive(Clone, Copy, Debug)]
pub struct Watch {
    pub events: EpollEvents,
    pub data: u64,
}

#[derive(Default)]
pub struct EpollInstance {
    pub watches: BTreeMap<i32, Watch>,
}

/// Guest epoll-fd -> instance table (spec.md §3's "Epoll Instance").
#[derive(Default)]
pub struct EpollTable {
    instances: BTreeMap<i32, EpollInstance>,
}

impl EpollTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&mut self, epfd: i32) {
        self.instances.insert(epfd, EpollInstance::default());
    }

    pub fn destroy(&mut self, epfd: i32) {
        self.instances.remove(&epfd);
    }

    pub fn contains(&self, epfd: i32) -> bool {
        self.instances.contains_key(&epfd)
    }

    pub fn add(&mut self, epfd: i32, fd: i32, events: EpollEvents, data: u64) -> Result<(), i64> {
        let inst = self
            .instances
            .get_mut(&epfd)
            .ok_or_else(|| friscy_core::errno::neg(friscy_core::errno::EBADF))?;
        inst.watches.insert(fd, Watch { events, data });
        Ok(())
    }

    pub fn modify(&mut self, epfd: i32, fd: i32, events: EpollEvents, data: u64) -> Result<(), i64> {
        let inst = self
            .instances
            .get_mut(&epfd)
            .ok_or_else(|| friscy_core::errno::neg(friscy_core::errno::EBADF))?;
        if !inst.watches.contains_key(&fd) {
            return Err(friscy_core::errno::neg(friscy_core::errno::ENOENT));
        }
        inst.watches.insert(fd, Watch { events, data });
        Ok(())
    }

    pub fn delete(&mut self, epfd: i32, fd: i32) -> Result<(), i64> {
        let inst = self
            .instances
            .get_mut(&epfd)
            .ok_or_else(|| friscy_core::errno::neg(friscy_core::errno::EBADF))?;
        inst.watches.remove(&fd).ok_or_else(|| friscy_core::errno::neg(friscy_core::errno::ENOENT))?;
        Ok(())
    }

    pub fn watches(&self, epfd: i32) -> Option<&BTreeMap<i32, Watch>> {
        self.instances.get(&epfd).map(|i| &i.watches)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_modify_delete_round_trip() {
        let mut table = EpollTable::new();
        table.create(10);
        table.add(10, 3, EpollEvents::IN, 42).unwrap();
        assert_eq!(table.watches(10).unwrap().get(&3).unwrap().data, 42);

        table.modify(10, 3, EpollEvents::OUT, 7).unwrap();
        assert_eq!(table.watches(10).unwrap().get(&3).unwrap().events, EpollEvents::OUT);

        table.delete(10, 3).unwrap();
        assert!(table.watches(10).unwrap().is_empty());
    }

    #[test]
    fn operations_on_unknown_epfd_are_ebadf() {
        let mut table = EpollTable::new();
        let err = table.add(99, 3, EpollEvents::IN, 0).unwrap_err();
        assert_eq!(err, friscy_core::errno::neg(friscy_core::errno::EBADF));
    }
}
