// Copyright 2020 - developers of the `grammers` project.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::defs::{DcFlags, DcOption};

/// Datacenter used when nothing else is known.
pub const DEFAULT_DC: i32 = 2;

const STATIC_V4: DcFlags = DcFlags {
    cdn: false,
    media: false,
    ipv6: false,
    static_address: true,
    tcpo_only: false,
};

const STATIC_V6: DcFlags = DcFlags {
    ipv6: true,
    ..STATIC_V4
};

const fn ipv4(id: i32, a: u8, b: u8, c: u8, d: u8) -> DcOption {
    DcOption {
        id,
        address: IpAddr::V4(Ipv4Addr::new(a, b, c, d)),
        port: 443,
        flags: STATIC_V4,
    }
}

#[allow(clippy::too_many_arguments)]
const fn ipv6(id: i32, a: u16, b: u16, c: u16, d: u16, e: u16, f: u16, g: u16, h: u16) -> DcOption {
    DcOption {
        id,
        address: IpAddr::V6(Ipv6Addr::new(a, b, c, d, e, f, g, h)),
        port: 443,
        flags: STATIC_V6,
    }
}

/// Hardcoded known `static` production options from `functions::help::GetConfig`.
pub const KNOWN_DC_OPTIONS: [DcOption; 10] = [
    ipv4(1, 149, 154, 175, 53),
    ipv6(1, 0x2001, 0xb28, 0xf23d, 0xf001, 0, 0, 0, 0xa),
    ipv4(2, 149, 154, 167, 41),
    ipv6(2, 0x2001, 0x67c, 0x4e8, 0xf002, 0, 0, 0, 0xa),
    ipv4(3, 149, 154, 175, 100),
    ipv6(3, 0x2001, 0xb28, 0xf23d, 0xf003, 0, 0, 0, 0xa),
    ipv4(4, 149, 154, 167, 92),
    ipv6(4, 0x2001, 0x67c, 0x4e8, 0xf004, 0, 0, 0, 0xa),
    ipv4(5, 91, 108, 56, 104),
    ipv6(5, 0x2001, 0xb28, 0xf23f, 0xf005, 0, 0, 0, 0xa),
];

/// Hardcoded known test-server options.
pub const KNOWN_TEST_DC_OPTIONS: [DcOption; 3] = [
    ipv4(1, 149, 154, 175, 10),
    ipv4(2, 149, 154, 167, 40),
    ipv4(3, 149, 154, 175, 117),
];

/// Statically-known IPv4 option for the given datacenter, if any.
pub fn known_dc_option(dc_id: i32, test_mode: bool) -> Option<DcOption> {
    let options: &[DcOption] = if test_mode {
        &KNOWN_TEST_DC_OPTIONS
    } else {
        &KNOWN_DC_OPTIONS
    };
    options
        .iter()
        .find(|option| option.id == dc_id && !option.flags.ipv6)
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_production_dc_has_both_families() {
        for dc_id in 1..=5 {
            let count = |ipv6| {
                KNOWN_DC_OPTIONS
                    .iter()
                    .filter(|o| o.id == dc_id && o.flags.ipv6 == ipv6)
                    .count()
            };
            assert_eq!(count(false), 1);
            assert_eq!(count(true), 1);
        }
    }

    #[test]
    fn known_option_prefers_ipv4() {
        let option = known_dc_option(DEFAULT_DC, false).unwrap();
        assert!(option.address.is_ipv4());
        assert_eq!(known_dc_option(4, true), None);
    }
}
