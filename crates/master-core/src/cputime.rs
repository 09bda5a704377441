//! Process CPU time, for the stats trailer.

/// Total user plus system CPU seconds consumed by this process so far.
///
/// Returns 0.0 on platforms without `getrusage`.
pub fn total_cpu_time() -> f64 {
    imp::total_cpu_time()
}

#[cfg(unix)]
mod imp {
    pub(super) fn total_cpu_time() -> f64 {
        let mut usage = unsafe { std::mem::zeroed::<libc::rusage>() };
        if unsafe { libc::getrusage(libc::RUSAGE_SELF, &mut usage) } != 0 {
            return 0.0;
        }
        timeval_secs(usage.ru_utime) + timeval_secs(usage.ru_stime)
    }

    fn timeval_secs(tv: libc::timeval) -> f64 {
        tv.tv_sec as f64 + tv.tv_usec as f64 / 1_000_000.0
    }
}

#[cfg(not(unix))]
mod imp {
    pub(super) fn total_cpu_time() -> f64 {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_time_is_nonnegative_and_monotone() {
        let before = total_cpu_time();
        assert!(before >= 0.0);
        // Burn a little CPU so the clock has something to count.
        let mut acc = 0u64;
        for i in 0..1_000_000u64 {
            acc = acc.wrapping_add(i * i);
        }
        assert!(acc > 0);
        assert!(total_cpu_time() >= before);
    }
}
