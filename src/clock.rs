// neutrino: a language runtime.
//
// Copyright (C) 2019  Brandon Lewis
//
// This program is free software: you can redistribute it and/or
// modify it under the terms of the GNU Lesser General Public License
// as published by the Free Software Foundation, either version 3 of
// the License, or (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// Lesser General Public License for more details.
//
// You should have received a copy of the GNU Lesser General Public
// License along with this program.  If not, see
// <https://www.gnu.org/licenses/>.

// Pluggable system collaborators. The runtime never touches the real
// file system or clock directly; embedders can substitute their own.

use std::fs;
use std::io::{self, Read};
use std::time::{SystemTime, UNIX_EPOCH};

pub trait FileSystem {
    fn read_file(&self, path: &str) -> io::Result<Vec<u8>>;
}

pub trait Clock {
    // Seconds since the epoch as a floating point value.
    fn seconds(&self) -> f64;
}

// The defaults used when no collaborator is plugged in.
pub struct NativeFileSystem;

impl FileSystem for NativeFileSystem {
    fn read_file(&self, path: &str) -> io::Result<Vec<u8>> {
        if path == "-" {
            let mut data = Vec::new();
            io::stdin().read_to_end(&mut data)?;
            Ok(data)
        } else {
            fs::read(path)
        }
    }
}

pub struct NativeClock;

impl Clock for NativeClock {
    fn seconds(&self) -> f64 {
        match SystemTime::now().duration_since(UNIX_EPOCH) {
            Ok(e) => (e.as_secs() as f64) + (0.001 * e.subsec_millis() as f64),
            Err(_) => 0.0,
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_native_clock_advances() {
        let clock = NativeClock;
        assert!(clock.seconds() > 0.0);
    }
}
