use std::fs::File;

use ole::{CompoundFile, OpenOptions};

fn main() {
    let path = std::env::args().nth(1).unwrap_or_else(|| "data/oledoc1.doc_".to_string());
    let file = File::open(&path).expect("file not found");
    let mut cf = CompoundFile::open(file, OpenOptions::read_only()).expect("not a valid CFB container");

    println!("major version: {}", cf.major_version());
    println!("file type: {:?}", cf.file_type());

    let mut root = cf.root_storage();
    root.visit_entries(true, &mut |entry| {
        println!("{:?} {} ({} bytes)", entry.kind, entry.name, entry.size);
    });
}
