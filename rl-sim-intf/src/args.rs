// Copyright (c) Ringlock Contributors.
use clap::{App, AppSettings, ArgMatches};
use serde::{Deserialize, Serialize};

use rl_util::*;

lazy_static::lazy_static! {
    static ref ARGS_STR: String = {
        let dfl_args = Args::default();
        format!(
            "-P, --workers=[COUNT]        'Number of worker processes (default: {dfl_workers})'
             -m, --mode=[MODE]            'Rings per worker: direct|threads|queues|threads-queues (default: {dfl_mode})'
             -n, --rings=[COUNT]          'Rings per worker in direct mode (default: {dfl_rings})'
             -T, --threads=[COUNT]        'Simulated threads per worker (default: {dfl_threads})'
             -Q, --nic-queues=[COUNT]     'Simulated NIC queues (default: {dfl_queues})'
             -q, --depth=[ENTRIES]        'Submission queue depth per ring (default: {dfl_depth})'
             -b, --buffers=[COUNT]        'Buffers per ring (default: {dfl_buffers})'
             -s, --buffer-size=[SIZE]     'Buffer size, accepts K/M/G suffixes (default: {dfl_buf_size})'
             -f, --fixed-fds=[COUNT]      'Fixed file descriptors per ring (default: {dfl_fds})'
             -k, --memlock-limit=[SIZE]   'Set RLIMIT_MEMLOCK to SIZE in each worker before it starts'
             -S, --safety-factor=[FACTOR] 'Margin applied to recommended limits (default: {dfl_safety:.2})'
             -p, --progress=[RINGS]       'Progress message every N ring attempts (default: {dfl_progress})'
                 --fail-fast=[COUNT]      'Give up after N failures once failures outnumber successes, 0 disables (default: {dfl_fail_fast})'
                 --no-mlock               'Skip mlock on buffers'
                 --per-buffer             'Map each buffer separately instead of one pooled region'
                 --guard                  'Map an inaccessible guard page after each buffer'
             -I, --interactive            'Redraw a live table instead of appending log rows'
             -a, --args=[FILE]            'Load base command line arguments from FILE'
             -v...                        'Sets the level of verbosity'",
            dfl_workers=dfl_args.workers,
            dfl_mode=dfl_args.mode,
            dfl_rings=dfl_args.rings,
            dfl_threads=dfl_args.threads,
            dfl_queues=dfl_args.nic_queues,
            dfl_depth=dfl_args.queue_depth,
            dfl_buffers=dfl_args.buffers,
            dfl_buf_size=format_size(dfl_args.buffer_size),
            dfl_fds=dfl_args.fixed_fds,
            dfl_safety=dfl_args.safety_factor,
            dfl_progress=dfl_args.progress,
            dfl_fail_fast=dfl_args.fail_fast)
    };
}

const ARGS_DOC: &str = "\
//
// rl-sim command line arguments
//
// This file provides the base values for a subset of command line arguments.
// They can be overridden from command line.
//
";

const HELP_BODY: &str = "\
Creates io_uring instances with registered, optionally memory-locked buffer
sets across multiple worker processes to characterize where RLIMIT_MEMLOCK
and vm.max_map_count run out, and prints recommended limit settings.";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Args {
    pub workers: u32,
    pub mode: String,
    pub rings: u32,
    pub threads: u32,
    pub nic_queues: u32,
    pub queue_depth: u32,
    pub buffers: u32,
    pub buffer_size: u64,
    pub fixed_fds: u32,
    pub no_mlock: bool,
    pub per_buffer: bool,
    pub guard: bool,
    pub memlock_limit: Option<u64>,
    pub safety_factor: f64,
    pub progress: u32,
    pub fail_fast: u32,

    #[serde(skip)]
    pub interactive: bool,
    #[serde(skip)]
    pub verbosity: u32,
}

impl Default for Args {
    fn default() -> Self {
        Self {
            workers: 1,
            mode: "direct".to_string(),
            rings: 20,
            threads: 1,
            nic_queues: 1,
            queue_depth: 512,
            buffers: 128,
            buffer_size: 16384,
            fixed_fds: 64,
            no_mlock: false,
            per_buffer: false,
            guard: false,
            memlock_limit: None,
            safety_factor: 1.5,
            progress: 1,
            fail_fast: 3,
            interactive: false,
            verbosity: 0,
        }
    }
}

impl JsonLoad for Args {}

impl JsonSave for Args {
    fn preamble() -> Option<String> {
        Some(ARGS_DOC.to_string())
    }
}

impl JsonArgs for Args {
    #[allow(dangerous_implicit_autorefs)]
    fn match_cmdline() -> ArgMatches<'static> {
        App::new("rl-sim")
            .version(*super::VERSION)
            .author(clap::crate_authors!("\n"))
            .about(HELP_BODY)
            .args_from_usage(&ARGS_STR)
            .setting(AppSettings::UnifiedHelpMessage)
            .setting(AppSettings::DeriveDisplayOrder)
            .get_matches()
    }

    fn verbosity(matches: &ArgMatches) -> u32 {
        matches.occurrences_of("v") as u32
    }

    fn process_cmdline(&mut self, matches: &ArgMatches) -> bool {
        let dfl: Args = Default::default();
        let mut updated_base = false;

        if let Some(v) = matches.value_of("workers") {
            self.workers = if v.len() > 0 {
                v.parse::<u32>().unwrap()
            } else {
                dfl.workers
            };
            updated_base = true;
        }
        if let Some(v) = matches.value_of("mode") {
            self.mode = if v.len() > 0 {
                v.to_string()
            } else {
                dfl.mode.clone()
            };
            updated_base = true;
        }
        if let Some(v) = matches.value_of("rings") {
            self.rings = if v.len() > 0 {
                v.parse::<u32>().unwrap()
            } else {
                dfl.rings
            };
            updated_base = true;
        }
        if let Some(v) = matches.value_of("threads") {
            self.threads = if v.len() > 0 {
                v.parse::<u32>().unwrap()
            } else {
                dfl.threads
            };
            updated_base = true;
        }
        if let Some(v) = matches.value_of("nic-queues") {
            self.nic_queues = if v.len() > 0 {
                v.parse::<u32>().unwrap()
            } else {
                dfl.nic_queues
            };
            updated_base = true;
        }
        if let Some(v) = matches.value_of("depth") {
            self.queue_depth = if v.len() > 0 {
                v.parse::<u32>().unwrap()
            } else {
                dfl.queue_depth
            };
            updated_base = true;
        }
        if let Some(v) = matches.value_of("buffers") {
            self.buffers = if v.len() > 0 {
                v.parse::<u32>().unwrap()
            } else {
                dfl.buffers
            };
            updated_base = true;
        }
        if let Some(v) = matches.value_of("buffer-size") {
            self.buffer_size = if v.len() > 0 {
                parse_size(v).unwrap()
            } else {
                dfl.buffer_size
            };
            updated_base = true;
        }
        if let Some(v) = matches.value_of("fixed-fds") {
            self.fixed_fds = if v.len() > 0 {
                v.parse::<u32>().unwrap()
            } else {
                dfl.fixed_fds
            };
            updated_base = true;
        }
        if let Some(v) = matches.value_of("memlock-limit") {
            self.memlock_limit = if v.len() > 0 {
                Some(parse_size(v).unwrap())
            } else {
                None
            };
            updated_base = true;
        }
        if let Some(v) = matches.value_of("safety-factor") {
            self.safety_factor = if v.len() > 0 {
                v.parse::<f64>().unwrap()
            } else {
                dfl.safety_factor
            };
            updated_base = true;
        }
        if let Some(v) = matches.value_of("progress") {
            self.progress = if v.len() > 0 {
                v.parse::<u32>().unwrap()
            } else {
                dfl.progress
            };
            updated_base = true;
        }
        if let Some(v) = matches.value_of("fail-fast") {
            self.fail_fast = if v.len() > 0 {
                v.parse::<u32>().unwrap()
            } else {
                dfl.fail_fast
            };
            updated_base = true;
        }
        if matches.is_present("no-mlock") {
            self.no_mlock = true;
            updated_base = true;
        }
        if matches.is_present("per-buffer") {
            self.per_buffer = true;
            updated_base = true;
        }
        if matches.is_present("guard") {
            self.guard = true;
            updated_base = true;
        }

        self.interactive = matches.is_present("interactive");
        self.verbosity = Self::verbosity(matches);

        updated_base
    }
}
