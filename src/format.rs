// Copyright (c) 2024 The Regents of the University of Michigan.
// Part of gantry, released under the BSD 3-Clause License.

use std::fmt;
use std::time::Duration;

/// Elapsed time shown by the process spinners and the closing log line.
///
/// `indicatif::HumanDuration` shows anything under a second as zero seconds,
/// so short runs print whole milliseconds instead. The alternate form
/// (`{:#}`) is compact.
#[derive(Clone, Copy, Debug)]
pub struct Elapsed(pub Duration);

impl fmt::Display for Elapsed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 >= Duration::from_secs(1) {
            return fmt::Display::fmt(&indicatif::HumanDuration(self.0), f);
        }

        let millis = self.0.as_millis();
        if f.alternate() {
            write!(f, "{millis}ms")
        } else if millis == 1 {
            f.write_str("1 millisecond")
        } else {
            write!(f, "{millis} milliseconds")
        }
    }
}
