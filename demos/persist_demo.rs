//! Writes a few entries, drops the map, reopens it, and prints what survived.

use filemap_rs::FileMap;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let base = dir.path().join("demo");

    {
        let map = FileMap::<u64, i64>::open(&base)?;
        map.insert(1, 100)?;
        map.insert(2, 200)?;
        map.insert(3, 300)?;
        map.remove(&2)?;
        println!("wrote {} entries, dropping the map", map.len()?);
    }

    let map = FileMap::<u64, i64>::open(&base)?;
    println!("reopened with {} entries:", map.len()?);
    let mut pairs = map.iter()?.collect::<Result<Vec<_>, _>>()?;
    pairs.sort_unstable();
    for (k, v) in pairs {
        println!("  {k} -> {v}");
    }
    Ok(())
}
