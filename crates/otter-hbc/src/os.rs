//! Advisory OS memory hooks
//!
//! Every function here is a hint. Failures are ignored and no function
//! changes observable behavior.

use std::sync::OnceLock;

/// Access-pattern advice for a memory range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advice {
    /// No special treatment
    Normal,
    /// Expect sequential reads
    Sequential,
    /// Expect random reads
    Random,
    /// Expect access soon
    WillNeed,
}

/// System page size, cached.
pub fn page_size() -> usize {
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
    *PAGE_SIZE.get_or_init(sys::page_size)
}

/// Applies `advice` to the pages covering `range`.
pub fn advise(range: &[u8], advice: Advice) -> bool {
    if range.is_empty() {
        return true;
    }
    sys::madvise(range, advice)
}

#[cfg(unix)]
#[allow(unsafe_code)]
mod sys {
    use super::Advice;

    pub(super) fn page_size() -> usize {
        // SAFETY: sysconf has no memory-safety preconditions.
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size > 0 { size as usize } else { 4096 }
    }

    pub(super) fn madvise(range: &[u8], advice: Advice) -> bool {
        let ps = super::page_size();
        let addr = range.as_ptr() as usize;
        let start = addr & !(ps - 1);
        let len = range.len() + (addr - start);
        let param = match advice {
            Advice::Normal => libc::MADV_NORMAL,
            Advice::Sequential => libc::MADV_SEQUENTIAL,
            Advice::Random => libc::MADV_RANDOM,
            Advice::WillNeed => libc::MADV_WILLNEED,
        };
        // SAFETY: the range covers pages already mapped for `range`; madvise
        // only changes paging hints and never the contents.
        unsafe { libc::madvise(start as *mut libc::c_void, len, param) == 0 }
    }
}

#[cfg(not(unix))]
mod sys {
    use super::Advice;

    pub(super) fn page_size() -> usize {
        4096
    }

    pub(super) fn madvise(_range: &[u8], _advice: Advice) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_size_is_power_of_two() {
        let ps = page_size();
        assert!(ps >= 1024);
        assert!(ps.is_power_of_two());
    }

    #[test]
    fn advice_never_disturbs_contents() {
        let data: Vec<u8> = (0..=255).cycle().take(3 * page_size()).collect();
        let before = data.clone();
        for advice in [Advice::Sequential, Advice::Random, Advice::WillNeed, Advice::Normal] {
            let _ = advise(&data[17..], advice);
        }
        assert_eq!(data, before);
        assert!(advise(&[], Advice::Random));
    }
}
