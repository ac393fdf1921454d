// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Walks through a handful of deferred copies and prints what the bytes look like before and
//! after the pages are touched.

mod logger;
mod mapping;

use std::process;

use anyhow::Context;
use clap::{ArgAction, Parser, ValueEnum};
use delay_memcpy::PageSize;

use crate::mapping::Mapping;

/// Number of bytes shown per dump.
const DUMP_LEN: usize = 20;

#[derive(Debug, Parser)]
#[clap(version, about)]
struct Args {
    /// Run only this scenario instead of all of them
    #[clap(short, long, value_enum)]
    scenario: Option<Scenario>,
    /// Enables verbose logging
    #[clap(short, long, action = ArgAction::Count)]
    verbose: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Scenario {
    /// One page, the copy happens when the destination is read
    ReadDst,
    /// One page, the copy happens when the destination is written
    WriteDst,
    /// One page, the copy happens when the source is written
    WriteSrc,
    /// Two aligned pages, touched one after the other
    TwoPages,
    /// One page worth of data starting a quarter page in
    Unaligned,
    /// Three pages of which only the middle one is touched
    MiddlePage,
}

impl Scenario {
    fn title(self) -> &'static str {
        match self {
            Scenario::ReadDst => "Copying one page of data, trigger copy via read dst...",
            Scenario::WriteDst => "Copying one page of data, trigger copy via write dst...",
            Scenario::WriteSrc => "Copying one page of data, trigger copy via write src...",
            Scenario::TwoPages => "Copying two pages of data...",
            Scenario::Unaligned => "Copying unaligned page of data...",
            Scenario::MiddlePage => "Copying one middle page data...",
        }
    }

    /// Number of pages each buffer needs.
    fn pages(self) -> usize {
        match self {
            Scenario::ReadDst | Scenario::WriteDst | Scenario::WriteSrc => 1,
            Scenario::TwoPages | Scenario::Unaligned => 2,
            Scenario::MiddlePage => 3,
        }
    }
}

fn main() {
    if let Err(err) = run() {
        log::error!("{err:?}");
        process::exit(1);
    }
}

fn run() -> anyhow::Result<()> {
    let args = Args::parse();
    logger::init(args.verbose);

    delay_memcpy::initialize().context("failed to set up deferred copies")?;
    let page = PageSize::system()?.get();

    let scenarios = match args.scenario {
        Some(scenario) => vec![scenario],
        None => Scenario::value_variants().to_vec(),
    };
    for scenario in scenarios {
        run_scenario(scenario, page)
            .with_context(|| format!("scenario {scenario:?} failed"))?;
    }

    if let Some(stats) = delay_memcpy::stats() {
        log::info!(
            "{} deferred, {} synchronous, {} faults, {} pages copied",
            stats.deferred,
            stats.synchronous,
            stats.faults,
            stats.pages_copied
        );
    }

    Ok(())
}

fn run_scenario(scenario: Scenario, page: usize) -> anyhow::Result<()> {
    let len = scenario.pages() * page;
    let mut src = Mapping::new(len)?;
    let dst = Mapping::new(len)?;
    src.randomize();

    println!("\n{}", scenario.title());

    let (offset, size) = match scenario {
        Scenario::Unaligned => (page / 4, page),
        _ => (0, len),
    };
    // the bytes shown in the first dump
    let shown = match scenario {
        Scenario::MiddlePage => page + page / 4,
        _ => offset,
    };

    println!("Before copy: {}", src.hex_dump(shown, DUMP_LEN));

    // Safety: both mappings are live and distinct, and every page is touched before they are
    // unmapped at the end of this function
    unsafe { delay_memcpy::delay_memcpy(dst.ptr(offset), src.ptr(offset), size)? };

    match scenario {
        Scenario::WriteDst => dst.increment(0),
        Scenario::WriteSrc => src.increment(0),
        _ => {}
    }

    // reading the source never triggers a copy
    println!("After copy : {}", src.hex_dump(shown, DUMP_LEN));
    println!("Destination: {}", dst.hex_dump(shown, DUMP_LEN));

    if scenario == Scenario::TwoPages {
        let second = page + page / 2;
        println!("2nd page:");
        println!("After copy : {}", src.hex_dump(second, DUMP_LEN));
        println!("Destination: {}", dst.hex_dump(second, DUMP_LEN));
    }

    log::debug!(
        "{} copies still pending after {scenario:?}",
        delay_memcpy::pending_copies()
    );
    dst.touch_all(page);
    Ok(())
}
