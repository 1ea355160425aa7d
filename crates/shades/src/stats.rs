//! Statistics Module - Execution and Commit Counters
//!
//! Plain counters, single-threaded like everything else in the core. The
//! driver prints them on shutdown when `be_verbose` is set, and the test
//! suite uses them to pin down scheduling and commit behavior.

/// Counters accumulated over the lifetime of one `Heap`.
#[derive(Debug, Default, Clone)]
pub struct Stats {
    /// Byte code sequences entered (one per `run_cont`).
    pub sequences_executed: u64,
    /// Byte code instructions executed.
    pub insns_executed: u64,
    /// Group commits performed.
    pub commits: u64,
    /// Words copied from the first generation into mature pages.
    pub words_promoted: u64,
    /// Words copied by mature-generation collection.
    pub words_collected: u64,
    /// Mature generations collected away.
    pub generations_collected: u64,
    /// Data pages written to the disk image (root block excluded).
    pub pages_written: u64,
    /// Root block writes (one per durable commit).
    pub root_writes: u64,
    /// Sequences restarted because their real allocation demand exceeded
    /// the current batch.
    pub flush_retries: u64,
    /// Threads moved into the blocked-thread table.
    pub threads_blocked: u64,
    /// Wakeups delivered from the network driver.
    pub wakeups_delivered: u64,
    /// Context switches between threads.
    pub context_switches: u64,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Human-readable summary, one counter per line.
    pub fn summary(&self) -> String {
        format!(
            "sequences executed:    {}\n\
             insns executed:        {}\n\
             commits:               {}\n\
             words promoted:        {}\n\
             words collected:       {}\n\
             generations collected: {}\n\
             pages written:         {}\n\
             root writes:           {}\n\
             flush retries:         {}\n\
             threads blocked:       {}\n\
             wakeups delivered:     {}\n\
             context switches:      {}",
            self.sequences_executed,
            self.insns_executed,
            self.commits,
            self.words_promoted,
            self.words_collected,
            self.generations_collected,
            self.pages_written,
            self.root_writes,
            self.flush_retries,
            self.threads_blocked,
            self.wakeups_delivered,
            self.context_switches,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_contains_counters() {
        let mut s = Stats::new();
        s.commits = 3;
        s.sequences_executed = 17;
        let text = s.summary();
        assert!(text.contains("commits:               3"));
        assert!(text.contains("sequences executed:    17"));
    }
}
