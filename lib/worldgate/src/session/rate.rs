use hashbrown::HashMap;

struct OpcodeCounter {
    count: u32,
    window_start: u64,
}

/// Per opcode inbound budget over a rolling window. Packets over budget are
/// dropped before they reach the queue.
pub struct RateTracker {
    counters: HashMap<u16, OpcodeCounter>,
}

impl RateTracker {
    pub fn new() -> RateTracker {
        RateTracker {
            counters: HashMap::new(),
        }
    }

    /// Returns true when the packet may be queued. The under-budget and
    /// over-budget branches reset the window differently (count 0 vs 1), a
    /// long-standing quirk kept for wire compatibility.
    pub fn accept(&mut self, opcode: u16, limit: u32, window_secs: u64, now: u64) -> bool {
        if limit == 0 || window_secs == 0 {
            return true;
        }

        let counter = self.counters.entry(opcode).or_insert(OpcodeCounter {
            count: 0,
            window_start: 0,
        });

        if counter.count < limit {
            if counter.window_start == 0 || now - counter.window_start > window_secs {
                counter.count = 0;
                counter.window_start = now;
            }

            counter.count += 1;
            return true;
        }

        if now - counter.window_start > window_secs {
            counter.count = 1;
            counter.window_start = now;
            return true;
        }

        false
    }
}
