// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>
#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Any input must yield chunks or an io error, never a panic
    let _ = promptpost::metadata::parse_text_chunks(std::io::Cursor::new(data));
});
