// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! `mlv`, a thin command surface over the core library. Real block-IO
//! wiring (open/close/resubmit against an actual block layer) is a host
//! integration left to whatever embeds this core; here it's stubbed
//! with `NullBlockLayer` so the command set can be exercised standalone.

use std::env;
use std::process::ExitCode;
use std::sync::Arc;

use melvin_core::block_layer::NullBlockLayer;
use melvin_core::lv::AllocationPolicy;
use melvin_core::vg::VolumeGroup;
use melvin_core::Core;

fn usage() -> String {
    "usage: mlv pvcreate <vg> <pv-id> <pe-count> <major:minor>\n       mlv lvcreate <vg> <le-count> [name]\n".to_string()
}

fn main() -> ExitCode {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        eprint!("{}", usage());
        return ExitCode::FAILURE;
    }

    let core = Core::init(Arc::new(NullBlockLayer));
    let mut vg = VolumeGroup::new("vg0");

    let result = match args[1].as_str() {
        "pvcreate" if args.len() == 6 => {
            let pe_count: u32 = match args[4].parse() {
                Ok(n) => n,
                Err(_) => {
                    eprintln!("bad pe-count: {}", args[4]);
                    return ExitCode::FAILURE;
                }
            };
            let device = match parse_device(&args[5]) {
                Some(d) => d,
                None => {
                    eprintln!("bad major:minor: {}", args[5]);
                    return ExitCode::FAILURE;
                }
            };
            vg.pv_add(args[3].clone(), pe_count, device, &core.devices)
                .map(|idx| log::info!("pv {} added at index {idx}", args[3]))
        }
        "lvcreate" if args.len() >= 4 => {
            let le_count: u32 = match args[3].parse() {
                Ok(n) => n,
                Err(_) => {
                    eprintln!("bad le-count: {}", args[3]);
                    return ExitCode::FAILURE;
                }
            };
            let name = args.get(4).cloned();
            let allocatable: Vec<usize> = vg.pv_list().map(|(i, _)| i).collect();
            vg.lv_create(name, le_count, AllocationPolicy::Contiguous, &allocatable)
                .map(|lv| log::info!("created {}", lv.name))
        }
        _ => {
            eprint!("{}", usage());
            return ExitCode::FAILURE;
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("mlv: {e}");
            ExitCode::FAILURE
        }
    }
}

fn parse_device(s: &str) -> Option<melvin_core::types::Device> {
    let (major, minor) = s.split_once(':')?;
    Some(melvin_core::types::Device {
        major: major.parse().ok()?,
        minor: minor.parse().ok()?,
    })
}
