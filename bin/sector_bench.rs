use procfs::CpuInfo;
use rand::distributions::Uniform;
use rand::{Rng, RngCore};
use rayon::prelude::*;
use sectorlite::config::StorageOptions;
use sectorlite::StorageManager;
use tempfile::TempDir;

const NUM_SECTORS: u64 = 4096;
const SECTOR_SIZE: u64 = 64 << 10;
const RAW_SIZE: f64 = (SECTOR_SIZE * NUM_SECTORS) as f64 / 1024f64 / 1024f64;

fn print_environment() {
    println!("SectorLite: version {}", env!("CARGO_PKG_VERSION"));

    let datetime = chrono::Utc::now();
    println!("Date: {:?}", datetime.naive_utc());

    match CpuInfo::new() {
        Ok(cpu_info) => {
            println!(
                "CPU: {} * {}",
                cpu_info.cpus.len(),
                cpu_info.fields.get("model name").map_or("unknown", String::as_str)
            );
            println!(
                "CPU Cache: {}",
                cpu_info.fields.get("cache size").map_or("unknown", String::as_str)
            );
        }
        Err(e) => println!("CPU: unknown ({})", e),
    }
}

fn print_arguments() {
    println!("Sectors: {} bytes each", SECTOR_SIZE);
    println!("Entries: {}", NUM_SECTORS);
    println!("RawSize: {} MB", RAW_SIZE);
}

fn root_of(i: u64) -> [u8; 32] {
    let mut root = [0u8; 32];
    root[..8].copy_from_slice(&i.to_le_bytes());
    root
}

struct BenchMark {
    temp_dir: TempDir,
    manager: StorageManager,
}

impl BenchMark {
    fn new() -> BenchMark {
        let temp_dir = tempfile::tempdir().unwrap();
        let manager = Self::open(&temp_dir);
        BenchMark { temp_dir, manager }
    }

    fn open(temp_dir: &TempDir) -> StorageManager {
        let options =
            StorageOptions::new(temp_dir.path().join("persist")).with_sector_size(SECTOR_SIZE);
        let manager = StorageManager::open(options).unwrap();
        manager
            .add_storage_folder(temp_dir.path().join("folder"), NUM_SECTORS * SECTOR_SIZE)
            .unwrap();
        manager
    }

    fn reopen(&mut self) {
        let temp_dir = tempfile::tempdir().unwrap();
        self.manager = Self::open(&temp_dir);
        self.temp_dir = temp_dir;
    }

    fn fill_seq(&self) {
        let mut random = rand::thread_rng();
        let mut data = vec![0u8; SECTOR_SIZE as usize];
        let start = std::time::Instant::now();
        for i in 0..NUM_SECTORS {
            random.fill_bytes(&mut data);
            self.manager.add_sector(root_of(i), &data).unwrap();
        }
        let elapsed = start.elapsed().as_secs_f64();
        println!(
            "fill_seq: {:?} MB/s | {:?}",
            RAW_SIZE / elapsed,
            self.manager.space()
        );
    }

    fn fill_virtual(&self) {
        let data = vec![0u8; SECTOR_SIZE as usize];
        let start = std::time::Instant::now();
        for i in 0..NUM_SECTORS {
            self.manager.add_sector(root_of(i), &data).unwrap();
        }
        let elapsed = start.elapsed().as_secs_f64();
        println!(
            "fill_virtual: {:?} adds per second",
            NUM_SECTORS as f64 / elapsed
        );
    }

    fn fill_parallel(&mut self) {
        self.reopen();
        let start = std::time::Instant::now();
        (0..NUM_SECTORS).into_par_iter().for_each(|i| {
            let mut data = vec![0u8; SECTOR_SIZE as usize];
            rand::thread_rng().fill_bytes(&mut data);
            self.manager.add_sector(root_of(i), &data).unwrap();
        });
        let elapsed = start.elapsed().as_secs_f64();
        println!(
            "fill_parallel: {:?} MB/s ({} threads)",
            RAW_SIZE / elapsed,
            rayon::current_num_threads()
        );
    }

    fn read_random(&self) {
        let mut random = rand::thread_rng().sample_iter(Uniform::new(0, NUM_SECTORS * 2));
        let mut not_found = 0;
        let start = std::time::Instant::now();
        for _ in 0..NUM_SECTORS {
            if self
                .manager
                .read_sector(root_of(random.next().unwrap()))
                .is_err()
            {
                not_found += 1;
            }
        }
        let elapsed = start.elapsed().as_secs_f64();
        println!(
            "read_random: {:?} reads per second ({} of {} found)",
            NUM_SECTORS as f64 / elapsed,
            NUM_SECTORS - not_found,
            NUM_SECTORS
        );
    }

    fn remove_seq(&self) {
        let start = std::time::Instant::now();
        for i in 0..NUM_SECTORS {
            self.manager.remove_sector(root_of(i)).unwrap();
        }
        let elapsed = start.elapsed().as_secs_f64();
        println!(
            "remove_seq: {:?} removes per second",
            NUM_SECTORS as f64 / elapsed
        );
    }
}

fn main() {
    print_environment();
    print_arguments();
    println!("-------------------------------------------------");
    let mut benchmark = BenchMark::new();
    benchmark.fill_seq();
    benchmark.fill_virtual();
    benchmark.read_random();
    benchmark.remove_seq();
    benchmark.fill_parallel();
    benchmark.read_random();
}
