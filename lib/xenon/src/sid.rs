use photon::status::{Code, Status};
use std::sync::Mutex;

/// Allocates the two-byte stream ids used to correlate requests with
/// responses on a channel. Ids are unique among outstanding requests;
/// released ids are handed out again before fresh ones. Id zero is never
/// handed out.
pub struct SIDManager {
    pool: Mutex<SIDPool>,
}

struct SIDPool {
    next: u32,
    released: Vec<u16>,
    allocated: u32,
}

impl SIDManager {
    pub fn new() -> SIDManager {
        SIDManager {
            pool: Mutex::new(SIDPool {
                next: 1,
                released: Vec::new(),
                allocated: 0,
            }),
        }
    }

    /// Hand out a free stream id as the two wire bytes. Fails with
    /// `NoMoreFreeSIDs` only when the whole 16-bit space is outstanding.
    pub fn allocate_sid(&self) -> Result<[u8; 2], Status> {
        let mut pool = self.pool.lock().unwrap();

        let sid = match pool.released.pop() {
            Some(sid) => sid,
            None => {
                if pool.next > u16::max_value() as u32 {
                    return Err(Status::error(Code::NoMoreFreeSIDs));
                }
                let sid = pool.next as u16;
                pool.next += 1;
                sid
            }
        };

        pool.allocated += 1;
        Ok([(sid & 0xff) as u8, (sid >> 8) as u8])
    }

    /// Return a stream id to the pool.
    pub fn release_sid(&self, sid: [u8; 2]) {
        let mut pool = self.pool.lock().unwrap();
        pool.released
            .push(sid[0] as u16 | ((sid[1] as u16) << 8));
        pool.allocated = pool.allocated.saturating_sub(1);
    }

    /// Number of ids currently outstanding.
    pub fn allocated_count(&self) -> u32 {
        self.pool.lock().unwrap().allocated
    }
}

impl Default for SIDManager {
    fn default() -> SIDManager {
        SIDManager::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hashbrown::HashSet;

    #[test]
    fn test_release_reuse() {
        let manager = SIDManager::new();

        let sid1 = manager.allocate_sid().unwrap();
        let sid2 = manager.allocate_sid().unwrap();

        manager.release_sid(sid2);

        let sid3 = manager.allocate_sid().unwrap();

        assert!(sid1[0] != sid2[0] || sid1[1] != sid2[1]);
        assert_eq!(sid2, sid3);
        assert_eq!(manager.allocated_count(), 2);
    }

    #[test]
    fn test_no_duplicates_outstanding() {
        let manager = SIDManager::new();
        let mut seen = HashSet::new();

        for _ in 0..1000 {
            let sid = manager.allocate_sid().unwrap();
            assert!(seen.insert(sid), "duplicate sid handed out: {:?}", sid);
        }

        assert_eq!(manager.allocated_count(), 1000);
    }

    #[test]
    fn test_zero_never_allocated() {
        let manager = SIDManager::new();

        for _ in 0..256 {
            let sid = manager.allocate_sid().unwrap();
            assert_ne!(sid, [0, 0]);
        }
    }

    #[test]
    fn test_exhaustion() {
        let manager = SIDManager::new();

        for _ in 0..u16::max_value() {
            manager.allocate_sid().unwrap();
        }

        let status = manager.allocate_sid().unwrap_err();
        assert_eq!(status.code, Code::NoMoreFreeSIDs);

        manager.release_sid([7, 3]);
        assert!(manager.allocate_sid().is_ok());
    }
}
