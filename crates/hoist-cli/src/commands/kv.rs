use std::path::Path;

use hoist_state::StateRead;

pub fn get(path: &Path, namespace: &str, key: &str) -> anyhow::Result<()> {
    let store = super::open_store(path)?;
    match store.kv_get(namespace, key)? {
        Some(entry) => println!("{}", entry.value),
        None => anyhow::bail!("{namespace}/{key} is not set"),
    }
    Ok(())
}

pub fn put(path: &Path, namespace: &str, key: &str, value: &str) -> anyhow::Result<()> {
    let store = super::open_store(path)?;
    let entry = store.write(|tx| tx.kv_put(namespace, key, value))?;
    println!("✓ {namespace}/{key} = {} (version {})", entry.value, entry.version);
    Ok(())
}

pub fn delete(path: &Path, namespace: &str, key: &str) -> anyhow::Result<()> {
    let store = super::open_store(path)?;
    if store.write(|tx| tx.kv_delete(namespace, key))? {
        println!("✓ Deleted {namespace}/{key}");
    } else {
        println!("{namespace}/{key} was not set");
    }
    Ok(())
}

pub fn keys(path: &Path, namespace: &str) -> anyhow::Result<()> {
    let store = super::open_store(path)?;
    for key in store.kv_keys(namespace)? {
        println!("{key}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn project() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("hoist.toml"), "").unwrap();
        dir
    }

    #[test]
    fn put_then_get_and_delete() {
        let dir = project();
        put(dir.path(), "global", "region", "eu-west-1").unwrap();
        put(dir.path(), "global", "region", "eu-central-1").unwrap();

        let store = crate::commands::open_store(dir.path()).unwrap();
        let entry = store.kv_get("global", "region").unwrap().unwrap();
        assert_eq!(entry.value, "eu-central-1");
        assert_eq!(entry.version, 2);
        drop(store);

        delete(dir.path(), "global", "region").unwrap();
        assert!(get(dir.path(), "global", "region").is_err());
    }
}
