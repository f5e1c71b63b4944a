use std::fs::File;
use std::io::{self, BufRead};
use std::path::Path;

pub mod config;
pub mod cv;
pub mod draw;
pub mod hls;
pub mod od;
pub mod pipeline;
pub mod server;
pub mod upload;
pub mod yolov8;

// The output is wrapped in a Result to allow matching on errors.
// Returns an Iterator to the Reader of the lines of the file.
pub fn read_lines<P>(filename: P) -> io::Result<io::Lines<io::BufReader<File>>>
where
    P: AsRef<Path>,
{
    let file = File::open(filename)?;
    Ok(io::BufReader::new(file).lines())
}
