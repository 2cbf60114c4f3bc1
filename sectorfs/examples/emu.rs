use sectorfs::io::FileSectorEmulatorBuilder;
use sectorfs::FileSystem;

pub fn main() {
    let tmp = tempfile::tempfile().unwrap();
    let dev = FileSectorEmulatorBuilder::from(tmp)
        .with_sector_count(4096)
        .build()
        .expect("Could not initialize disk emulator.");

    // create a new file system on the device and populate it
    let mut fs = FileSystem::format(dev).expect("should format");
    fs.mkdir("/docs").unwrap();
    fs.create("/docs/hello", 12).unwrap();
    fs.write_file("/docs/hello", 0, b"hello world\n").unwrap();

    fs.recursive_list("/", &mut std::io::stdout()).unwrap();
    print!("{}", String::from_utf8_lossy(&fs.read_file("/docs/hello").unwrap()));
}
