//! Cache behavior across the two levels, batch execution, plugins and
//! transaction outcomes.

use std::fs;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use pretty_assertions::assert_eq;
use squill::io::ResourceResolver;
use squill::plugin::{InterceptPoint, Interceptor, Invocation, Outcome, Proceed};
use squill::testing::MemoryDriver;
use squill::{ExecutorType, SqlSessionFactoryBuilder, Value};
use tempdir::TempDir;

const CONFIG: &str = r#"
<configuration>
  <environments default="dev">
    <environment id="dev">
      <transactionManager type="LOCAL"/>
      <dataSource type="POOLED">
        <property name="driver" value="mem"/>
        <property name="url" value="mem://cachedb"/>
      </dataSource>
    </environment>
  </environments>
  <mappers>
    <mapper resource="cached.xml"/>
  </mappers>
</configuration>
"#;

const CACHED_MAPPER: &str = r#"
<mapper namespace="app.CachedMapper">
  <cache readOnly="true" size="64"/>

  <select id="selectAll" resultType="map">
    select * from cached_things
  </select>

  <update id="touch" flushCache="true">
    update cached_things set touched = 1
  </update>
</mapper>
"#;

fn build_factory(
    driver: &MemoryDriver,
    config: &str,
    mapper: &str,
    plugins: Vec<(&str, Box<dyn Interceptor>)>,
) -> squill::SqlSessionFactory {
    let dir = TempDir::new("squill-cache").unwrap();
    fs::write(dir.path().join("cached.xml"), mapper).unwrap();
    let mut builder = SqlSessionFactoryBuilder::new()
        .resolver(ResourceResolver::new([dir.path().to_path_buf()]))
        .register_driver("mem", Arc::new(driver.clone()));
    for (name, interceptor) in plugins {
        builder = builder.register_interceptor(name, interceptor);
    }
    builder.build_from_xml(config).unwrap()
}

fn seed_rows(driver: &MemoryDriver) {
    driver.respond_rows(
        "from cached_things",
        MemoryDriver::rows(&["id"], &[&[Value::Int(1)]]),
    );
}

#[test]
fn first_level_cache_serves_repeated_queries() {
    let driver = MemoryDriver::new();
    seed_rows(&driver);
    let mapper_without_cache = CACHED_MAPPER.replace("<cache readOnly=\"true\" size=\"64\"/>", "");
    let factory = build_factory(&driver, CONFIG, &mapper_without_cache, Vec::new());
    let mut session = factory.open_session().unwrap();

    let first: Vec<Value> = session.select_list("app.CachedMapper.selectAll", ()).unwrap();
    let second: Vec<Value> = session.select_list("app.CachedMapper.selectAll", ()).unwrap();
    assert_eq!(first, second);
    assert_eq!(driver.executed().len(), 1);

    // any update clears the session cache
    session.update("app.CachedMapper.touch", ()).unwrap();
    let _: Vec<Value> = session.select_list("app.CachedMapper.selectAll", ()).unwrap();
    assert_eq!(
        driver
            .executed_sql()
            .iter()
            .filter(|sql| sql.contains("from cached_things"))
            .count(),
        2
    );
}

#[test]
fn second_level_cache_is_commit_visible() {
    let driver = MemoryDriver::new();
    seed_rows(&driver);
    let factory = build_factory(&driver, CONFIG, CACHED_MAPPER, Vec::new());

    let mut writer = factory.open_session().unwrap();
    let _: Vec<Value> = writer.select_list("app.CachedMapper.selectAll", ()).unwrap();
    assert_eq!(driver.executed().len(), 1);

    // before the writer commits, a sibling session misses the shared cache
    let mut sibling = factory.open_session().unwrap();
    let _: Vec<Value> = sibling.select_list("app.CachedMapper.selectAll", ()).unwrap();
    assert_eq!(driver.executed().len(), 2);

    writer.commit().unwrap();

    // after commit the shared entry serves new sessions without the driver
    let mut reader = factory.open_session().unwrap();
    let rows: Vec<Value> = reader.select_list("app.CachedMapper.selectAll", ()).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(driver.executed().len(), 2);
}

#[test]
fn flush_cache_update_clears_the_namespace_cache_on_commit() {
    let driver = MemoryDriver::new();
    seed_rows(&driver);
    let factory = build_factory(&driver, CONFIG, CACHED_MAPPER, Vec::new());

    let mut session = factory.open_session().unwrap();
    let _: Vec<Value> = session.select_list("app.CachedMapper.selectAll", ()).unwrap();
    session.commit().unwrap();

    let mut updater = factory.open_session().unwrap();
    updater.update("app.CachedMapper.touch", ()).unwrap();
    updater.commit().unwrap();

    let mut reader = factory.open_session().unwrap();
    let _: Vec<Value> = reader.select_list("app.CachedMapper.selectAll", ()).unwrap();
    // the select ran again because the update flushed the namespace cache
    assert_eq!(
        driver
            .executed_sql()
            .iter()
            .filter(|sql| sql.contains("from cached_things"))
            .count(),
        2
    );
}

#[test]
fn rollback_discards_staged_cache_entries() {
    let driver = MemoryDriver::new();
    seed_rows(&driver);
    let factory = build_factory(&driver, CONFIG, CACHED_MAPPER, Vec::new());

    let mut session = factory.open_session().unwrap();
    let _: Vec<Value> = session.select_list("app.CachedMapper.selectAll", ()).unwrap();
    session.rollback().unwrap();
    drop(session);

    let mut reader = factory.open_session().unwrap();
    let _: Vec<Value> = reader.select_list("app.CachedMapper.selectAll", ()).unwrap();
    assert_eq!(driver.executed().len(), 2);
}

#[test]
fn batch_updates_queue_until_flush() {
    let driver = MemoryDriver::new();
    let factory = build_factory(&driver, CONFIG, CACHED_MAPPER, Vec::new());
    let mut session = factory
        .open_session_with(ExecutorType::Batch, false)
        .unwrap();

    assert_eq!(session.update("app.CachedMapper.touch", ()).unwrap(), 0);
    assert_eq!(session.update("app.CachedMapper.touch", ()).unwrap(), 0);
    assert!(driver.executed().is_empty());

    let results = session.flush_statements().unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].update_counts, vec![1, 1]);
    assert_eq!(driver.executed().len(), 2);
}

struct CountingInterceptor {
    queries: Arc<AtomicUsize>,
}

impl Interceptor for CountingInterceptor {
    fn points(&self) -> &[InterceptPoint] {
        &[InterceptPoint::ExecutorQuery]
    }

    fn intercept(&self, invocation: Invocation<'_>, proceed: &mut Proceed<'_>) -> squill::Result<Outcome> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        proceed(invocation)
    }
}

#[test]
fn plugins_wrap_executor_queries() {
    let driver = MemoryDriver::new();
    seed_rows(&driver);
    let queries = Arc::new(AtomicUsize::new(0));
    let config_with_plugin = CONFIG.replace(
        "<environments",
        "<plugins><plugin interceptor=\"counter\"/></plugins>\n  <environments",
    );
    let factory = build_factory(
        &driver,
        &config_with_plugin,
        CACHED_MAPPER,
        vec![(
            "counter",
            Box::new(CountingInterceptor {
                queries: queries.clone(),
            }),
        )],
    );
    let mut session = factory.open_session().unwrap();
    let _: Vec<Value> = session.select_list("app.CachedMapper.selectAll", ()).unwrap();
    let _: Vec<Value> = session.select_list("app.CachedMapper.selectAll", ()).unwrap();
    // the interceptor sees every call, cached or not
    assert_eq!(queries.load(Ordering::SeqCst), 2);
}

#[test]
fn dirty_sessions_roll_back_when_dropped_uncommitted() {
    let driver = MemoryDriver::new();
    let factory = build_factory(&driver, CONFIG, CACHED_MAPPER, Vec::new());
    {
        let mut session = factory.open_session().unwrap();
        session.update("app.CachedMapper.touch", ()).unwrap();
        // dropped without commit
    }
    assert_eq!(driver.rollback_count(), 1);
    assert_eq!(driver.commit_count(), 0);
}

#[test]
fn committed_updates_reach_the_connection() {
    let driver = MemoryDriver::new();
    let factory = build_factory(&driver, CONFIG, CACHED_MAPPER, Vec::new());
    let mut session = factory.open_session().unwrap();
    session.update("app.CachedMapper.touch", ()).unwrap();
    session.commit().unwrap();
    session.close().unwrap();
    assert_eq!(driver.commit_count(), 1);
    assert_eq!(driver.rollback_count(), 0);
}
