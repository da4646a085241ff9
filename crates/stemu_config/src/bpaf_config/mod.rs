/*
    StEmu

    Copyright 2022-2025 Daniel Balsom

    Permission is hereby granted, free of charge, to any person obtaining a
    copy of this software and associated documentation files (the “Software”),
    to deal in the Software without restriction, including without limitation
    the rights to use, copy, modify, merge, publish, distribute, sublicense,
    and/or sell copies of the Software, and to permit persons to whom the
    Software is furnished to do so, subject to the following conditions:

    The above copyright notice and this permission notice shall be included in
    all copies or substantial portions of the Software.

    THE SOFTWARE IS PROVIDED “AS IS”, WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
    IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
    FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
    AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
    LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
    FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER
    DEALINGS IN THE SOFTWARE.

    --------------------------------------------------------------------------

    bpaf_config/mod.rs

    Command line arguments, read with bpaf.
*/

use std::path::PathBuf;

use crate::mount::MountSpec;
use stemu_core::machine_types::VideoMode;

use bpaf::{Bpaf, Parser};

fn mount_arg() -> impl Parser<Vec<MountSpec>> {
    bpaf::short('m')
        .long("mount")
        .help("Mount media with syntax: fd:0:disk.st or hd:0:disk.img, options after '?', eg. fd:0:disk.st?wp&ghost")
        .argument::<String>("mountspec")
        .parse(|s| s.parse::<MountSpec>())
        .many()
}

#[derive(Debug, Default, Bpaf)]
#[bpaf(options, version, generate(cli_args))]
pub struct CmdLineArgs {
    #[bpaf(long("config_file"), long("configfile"))]
    pub config_file: Option<PathBuf>,

    /// Number of video frames to run
    #[bpaf(long)]
    pub frames: Option<u32>,

    /// Video timing: pal, ntsc or mono
    #[bpaf(long)]
    pub video: Option<VideoMode>,

    #[bpaf(long)]
    pub cpu_hz: Option<u32>,

    #[bpaf(long("accurate_floppy"), long("adat"), switch)]
    pub accurate_floppy: bool,

    #[bpaf(long, switch)]
    pub advanced_timing: bool,

    /// Feed this file into the MIDI input
    #[bpaf(long)]
    pub midi_feed: Option<PathBuf>,

    #[bpaf(long, switch)]
    pub midi_loopback: bool,

    #[bpaf(external(mount_arg))]
    pub mounts: Vec<MountSpec>,
}
