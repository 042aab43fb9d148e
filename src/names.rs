// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Naming conventions shared by the proxy and the cache daemon. Both sides
// derive every object name from these helpers, so they must stay in sync.

/// Well-known name of the command channel.
pub const CMD_CHANNEL: &str = "/cmd_msg_q";

/// Default prefix of data segment names (`/data_shm_<index>`).
pub const DEFAULT_SEGMENT_PREFIX: &str = "data";

/// Longest segment name that fits in a command record (64 bytes incl. NUL).
pub const SEGMENT_NAME_MAX: usize = 63;

/// Longest request path that fits in a command record (128 bytes incl. NUL).
pub const PATH_MAX: usize = 127;

const READY_SUFFIX: &str = "_reader";
const RELEASE_SUFFIX: &str = "_writer";

/// POSIX object name with exactly one leading '/'.
pub fn posix_name(name: &str) -> String {
    if name.starts_with('/') {
        name.to_string()
    } else {
        format!("/{name}")
    }
}

/// Name of pool slot `index`. Generation 0 is the slot's original segment;
/// replacements created after a retired segment carry their generation.
pub fn segment_name(prefix: &str, index: usize, generation: u32) -> String {
    if generation == 0 {
        format!("/{prefix}_shm_{index}")
    } else {
        format!("/{prefix}_shm_{index}.{generation}")
    }
}

/// Semaphore signalled by the producer when the header or a chunk is ready.
pub fn ready_sem_name(segment: &str) -> String {
    format!("{}{READY_SUFFIX}", posix_name(segment))
}

/// Semaphore signalled by the consumer when it is done with the buffer.
pub fn release_sem_name(segment: &str) -> String {
    format!("{}{RELEASE_SUFFIX}", posix_name(segment))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn posix_name_prepends_slash() {
        assert_eq!(posix_name("foo"), "/foo");
        assert_eq!(posix_name("/bar"), "/bar");
    }

    #[test]
    fn default_segment_names() {
        assert_eq!(segment_name(DEFAULT_SEGMENT_PREFIX, 0, 0), "/data_shm_0");
        assert_eq!(segment_name(DEFAULT_SEGMENT_PREFIX, 7, 0), "/data_shm_7");
        assert_eq!(segment_name("t", 2, 3), "/t_shm_2.3");
    }

    #[test]
    fn semaphore_names_follow_segment() {
        assert_eq!(ready_sem_name("/data_shm_1"), "/data_shm_1_reader");
        assert_eq!(release_sem_name("data_shm_1"), "/data_shm_1_writer");
    }
}
