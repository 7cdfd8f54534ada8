//! End-to-end coverage: XML configuration + mapper files resolved from
//! disk, executed against the in-memory driver.

use std::fs;
use std::sync::Arc;

use pretty_assertions::assert_eq;
use serde::{Deserialize, Serialize};
use squill::io::ResourceResolver;
use squill::testing::MemoryDriver;
use squill::{SqlSessionFactory, SqlSessionFactoryBuilder, Value};
use tempdir::TempDir;

const CONFIG: &str = r#"
<configuration>
  <properties>
    <property name="mainUrl" value="mem://main"/>
  </properties>
  <settings>
    <setting name="mapUnderscoreToCamelCase" value="true"/>
  </settings>
  <environments default="dev">
    <environment id="dev">
      <transactionManager type="LOCAL"/>
      <dataSource type="POOLED">
        <property name="driver" value="mem"/>
        <property name="url" value="${mainUrl}"/>
      </dataSource>
    </environment>
  </environments>
  <mappers>
    <mapper resource="users.xml"/>
  </mappers>
</configuration>
"#;

const USERS_MAPPER: &str = r#"
<mapper namespace="app.UserMapper">
  <resultMap id="userMap" type="map">
    <id property="id" column="id"/>
    <result property="name" column="user_name"/>
  </resultMap>

  <sql id="columns">id, user_name</sql>

  <select id="selectUser" resultMap="userMap">
    select <include refid="columns"/> from users where id = #{id}
  </select>

  <select id="selectActive" resultType="map">
    select * from users
    <where>
      <if test="minAge != null">AND age &gt;= #{minAge}</if>
      <if test="ids != null">
        AND id in
        <foreach collection="ids" item="id" open="(" close=")" separator=",">#{id}</foreach>
      </if>
    </where>
  </select>

  <select id="countUsers" resultType="long">
    select count(*) from users
  </select>

  <insert id="insertUser" useGeneratedKeys="true" keyProperty="id">
    insert into users (user_name) values (#{name})
  </insert>

  <update id="updateUser">
    update users set user_name = #{name} where id = #{id}
  </update>

  <delete id="deleteUser">
    delete from users where id = #{id}
  </delete>
</mapper>
"#;

#[derive(Debug, PartialEq, Serialize, Deserialize)]
struct User {
    id: i64,
    name: String,
}

fn factory_with(driver: &MemoryDriver, config: &str, mappers: &[(&str, &str)]) -> SqlSessionFactory {
    let dir = TempDir::new("squill-test").unwrap();
    for (name, xml) in mappers {
        fs::write(dir.path().join(name), xml).unwrap();
    }
    let factory = SqlSessionFactoryBuilder::new()
        .resolver(ResourceResolver::new([dir.path().to_path_buf()]))
        .register_driver("mem", Arc::new(driver.clone()))
        .build_from_xml(config)
        .unwrap();
    factory
}

fn users_factory(driver: &MemoryDriver) -> SqlSessionFactory {
    factory_with(driver, CONFIG, &[("users.xml", USERS_MAPPER)])
}

#[test]
fn selects_map_rows_into_record_shapes() {
    let driver = MemoryDriver::new();
    driver.respond_rows(
        "from users where id =",
        MemoryDriver::rows(
            &["id", "user_name"],
            &[&[Value::Int(1), Value::Str("ada".into())]],
        ),
    );
    let factory = users_factory(&driver);
    let mut session = factory.open_session().unwrap();

    let user: Option<User> = session.select_one("app.UserMapper.selectUser", 1).unwrap();
    assert_eq!(
        user,
        Some(User {
            id: 1,
            name: "ada".into()
        })
    );

    let executed = driver.executed();
    assert_eq!(
        executed[0].sql,
        "select id, user_name from users where id = ?"
    );
    assert_eq!(executed[0].parameters, vec![Value::Int(1)]);
}

#[test]
fn scalar_result_types_come_back_bare() {
    let driver = MemoryDriver::new();
    driver.respond_rows(
        "count(*)",
        MemoryDriver::rows(&["count"], &[&[Value::Int(12)]]),
    );
    let factory = users_factory(&driver);
    let mut session = factory.open_session().unwrap();
    let count: Option<i64> = session.select_one("app.UserMapper.countUsers", ()).unwrap();
    assert_eq!(count, Some(12));
}

#[test]
fn dynamic_where_and_foreach_render_through_xml() {
    let driver = MemoryDriver::new();
    let factory = users_factory(&driver);
    let mut session = factory.open_session().unwrap();

    #[derive(Serialize)]
    struct Filter {
        #[serde(rename = "minAge")]
        min_age: Option<i64>,
        ids: Option<Vec<i64>>,
    }

    let _rows: Vec<Value> = session
        .select_list(
            "app.UserMapper.selectActive",
            Filter {
                min_age: Some(18),
                ids: Some(vec![10, 20, 30]),
            },
        )
        .unwrap();
    let executed = driver.executed();
    assert_eq!(
        executed[0].sql,
        "select * from users WHERE age >= ? AND id in ( ? , ? , ? )"
    );
    assert_eq!(
        executed[0].parameters,
        vec![
            Value::Int(18),
            Value::Int(10),
            Value::Int(20),
            Value::Int(30)
        ]
    );

    // both conditions off: no WHERE at all
    let _rows: Vec<Value> = session
        .select_list(
            "app.UserMapper.selectActive",
            Filter {
                min_age: None,
                ids: None,
            },
        )
        .unwrap();
    assert_eq!(driver.executed()[1].sql, "select * from users");
}

#[test]
fn generated_keys_write_back_into_the_parameter() {
    let driver = MemoryDriver::new();
    let factory = users_factory(&driver);
    let mut session = factory.open_session().unwrap();

    let (count, parameter) = session
        .insert_with_keys(
            "app.UserMapper.insertUser",
            Value::from_iter([("name".to_string(), Value::Str("ada".into()))]),
        )
        .unwrap();
    assert_eq!(count, 1);
    assert_eq!(parameter.get("id"), Some(&Value::Int(1)));
}

#[test]
fn select_key_runs_before_the_insert() {
    let driver = MemoryDriver::new();
    driver.respond_rows(
        "select next_id",
        MemoryDriver::rows(&["id"], &[&[Value::Int(77)]]),
    );
    let mapper = r#"
<mapper namespace="app.SeqMapper">
  <insert id="insertWithSeq">
    <selectKey keyProperty="id" order="BEFORE" resultType="long">
      select next_id from sequence_table
    </selectKey>
    insert into users (id, user_name) values (#{id}, #{name})
  </insert>
</mapper>
"#;
    let config = CONFIG.replace("users.xml", "seq.xml");
    let factory = factory_with(&driver, &config, &[("seq.xml", mapper)]);
    let mut session = factory.open_session().unwrap();

    let (_, parameter) = session
        .insert_with_keys(
            "app.SeqMapper.insertWithSeq",
            Value::from_iter([("name".to_string(), Value::Str("ada".into()))]),
        )
        .unwrap();
    assert_eq!(parameter.get("id"), Some(&Value::Int(77)));

    let sql = driver.executed_sql();
    assert!(sql[0].contains("next_id"));
    assert!(sql[1].starts_with("insert into users"));
    assert_eq!(
        driver.executed()[1].parameters,
        vec![Value::Int(77), Value::Str("ada".into())]
    );
}

#[test]
fn database_id_picks_vendor_specific_statements() {
    let driver = MemoryDriver::with_product("Memory DB v3");
    let config = r#"
<configuration>
  <environments default="dev">
    <environment id="dev">
      <transactionManager type="LOCAL"/>
      <dataSource type="UNPOOLED">
        <property name="driver" value="mem"/>
        <property name="url" value="mem://main"/>
      </dataSource>
    </environment>
  </environments>
  <databaseIdProvider type="DB_VENDOR">
    <property name="Memory" value="mem"/>
    <property name="PostgreSQL" value="pg"/>
  </databaseIdProvider>
  <mappers>
    <mapper resource="vendor.xml"/>
  </mappers>
</configuration>
"#;
    let mapper = r#"
<mapper namespace="app.VendorMapper">
  <select id="now" resultType="string" databaseId="mem">select mem_now()</select>
  <select id="now" resultType="string" databaseId="pg">select pg_now()</select>
  <select id="now" resultType="string">select generic_now()</select>
</mapper>
"#;
    let factory = factory_with(&driver, config, &[("vendor.xml", mapper)]);
    let mut session = factory.open_session().unwrap();
    let _: Vec<Value> = session.select_list("app.VendorMapper.now", ()).unwrap();
    assert_eq!(driver.executed_sql().last().unwrap(), "select mem_now()");
}

#[test]
fn result_map_extends_resolves_across_the_incomplete_queue() {
    let driver = MemoryDriver::new();
    driver.respond_rows(
        "from people",
        MemoryDriver::rows(
            &["id", "user_name", "age"],
            &[&[Value::Int(1), Value::Str("ada".into()), Value::Int(36)]],
        ),
    );
    // the extending map appears before its parent on purpose
    let mapper = r#"
<mapper namespace="app.PeopleMapper">
  <resultMap id="detailed" type="map" extends="base">
    <result property="age" column="age"/>
  </resultMap>
  <resultMap id="base" type="map">
    <id property="id" column="id"/>
    <result property="name" column="user_name"/>
  </resultMap>
  <select id="selectPerson" resultMap="detailed">select * from people</select>
</mapper>
"#;
    let config = CONFIG.replace("users.xml", "people.xml");
    let factory = factory_with(&driver, &config, &[("people.xml", mapper)]);
    let mut session = factory.open_session().unwrap();

    let rows: Vec<Value> = session
        .select_list("app.PeopleMapper.selectPerson", ())
        .unwrap();
    assert_eq!(rows[0].get("age"), Some(&Value::Int(36)));
    assert_eq!(rows[0].get("name"), Some(&Value::Str("ada".into())));
    assert_eq!(rows[0].get("id"), Some(&Value::Int(1)));
}

#[test]
fn unresolved_references_fail_the_load_with_a_diagnostic() {
    let driver = MemoryDriver::new();
    let mapper = r#"
<mapper namespace="app.BrokenMapper">
  <select id="broken" resultMap="missingMap">select 1</select>
</mapper>
"#;
    let dir = TempDir::new("squill-broken").unwrap();
    fs::write(dir.path().join("broken.xml"), mapper).unwrap();
    let config = CONFIG.replace("users.xml", "broken.xml");
    let error = SqlSessionFactoryBuilder::new()
        .resolver(ResourceResolver::new([dir.path().to_path_buf()]))
        .register_driver("mem", Arc::new(driver))
        .build_from_xml(&config)
        .unwrap_err();
    let message = error.to_string();
    assert!(message.contains("missingMap"), "got: {message}");
}

#[test]
fn unknown_settings_are_fatal() {
    let driver = MemoryDriver::new();
    let config = r#"
<configuration>
  <settings>
    <setting name="enableTurbo" value="true"/>
  </settings>
  <environments default="dev">
    <environment id="dev">
      <transactionManager type="LOCAL"/>
      <dataSource type="UNPOOLED">
        <property name="driver" value="mem"/>
        <property name="url" value="mem://main"/>
      </dataSource>
    </environment>
  </environments>
  <mappers/>
</configuration>
"#;
    let error = SqlSessionFactoryBuilder::new()
        .register_driver("mem", Arc::new(driver))
        .build_from_xml(config)
        .unwrap_err();
    assert!(error.to_string().contains("enableTurbo"));
}

#[test]
fn mapper_proxy_checks_statement_kinds() {
    let driver = MemoryDriver::new();
    let factory = users_factory(&driver);
    let mut session = factory.open_session().unwrap();
    let mut mapper = session.mapper("app.UserMapper").unwrap();

    // calling a select through update is a binding error
    let error = mapper.update("selectUser", 1).unwrap_err();
    assert!(error.to_string().contains("cannot be invoked"));

    let affected = mapper
        .update(
            "updateUser",
            Value::from_iter([
                ("id".to_string(), Value::Int(1)),
                ("name".to_string(), Value::Str("b".into())),
            ]),
        )
        .unwrap();
    assert_eq!(affected, 1);
}

#[test]
fn unknown_statements_report_near_misses() {
    let driver = MemoryDriver::new();
    let factory = users_factory(&driver);
    let mut session = factory.open_session().unwrap();
    let error = session
        .select_rows("app.UserMapper.selectUsr", (), squill::RowBounds::default())
        .unwrap_err();
    let message = error.to_string();
    assert!(message.contains("selectUsr"));
    assert!(message.contains("selectUser"), "got: {message}");
}

#[test]
fn driver_failures_carry_the_error_breadcrumb() {
    let driver = MemoryDriver::new();
    driver.respond_error("from users where id =", "table dropped");
    let factory = users_factory(&driver);
    let mut session = factory.open_session().unwrap();
    let error = session
        .select_one::<User>("app.UserMapper.selectUser", 1)
        .unwrap_err();
    let message = error.to_string();
    assert!(message.contains("app.UserMapper.selectUser"), "got: {message}");
    assert!(message.contains("executing a query"));
    assert!(message.contains("table dropped"));
}

#[test]
fn too_many_rows_for_select_one_is_an_error() {
    let driver = MemoryDriver::new();
    driver.respond_rows(
        "from users where id =",
        MemoryDriver::rows(
            &["id", "user_name"],
            &[
                &[Value::Int(1), Value::Str("a".into())],
                &[Value::Int(2), Value::Str("b".into())],
            ],
        ),
    );
    let factory = users_factory(&driver);
    let mut session = factory.open_session().unwrap();
    let error = session
        .select_one::<User>("app.UserMapper.selectUser", 1)
        .unwrap_err();
    assert!(error.to_string().contains("expected one row"));
}

#[test]
fn row_bounds_skip_and_limit() {
    let driver = MemoryDriver::new();
    driver.respond_rows(
        "from users",
        MemoryDriver::rows(
            &["id", "user_name"],
            &[
                &[Value::Int(1), Value::Str("a".into())],
                &[Value::Int(2), Value::Str("b".into())],
                &[Value::Int(3), Value::Str("c".into())],
            ],
        ),
    );
    let factory = users_factory(&driver);
    let mut session = factory.open_session().unwrap();
    let rows: Vec<Value> = session
        .select_list_bounds(
            "app.UserMapper.selectActive",
            (),
            squill::RowBounds::new(1, 1),
        )
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("id"), Some(&Value::Int(2)));
}

#[test]
fn joined_rows_group_into_nested_collections() {
    let driver = MemoryDriver::new();
    driver.respond_rows(
        "from orders",
        MemoryDriver::rows(
            &["id", "buyer", "item_sku", "item_qty"],
            &[
                &[
                    Value::Int(1),
                    Value::Str("ada".into()),
                    Value::Str("a-1".into()),
                    Value::Int(2),
                ],
                &[
                    Value::Int(1),
                    Value::Str("ada".into()),
                    Value::Str("b-9".into()),
                    Value::Int(1),
                ],
                &[
                    Value::Int(2),
                    Value::Str("grace".into()),
                    Value::Str("a-1".into()),
                    Value::Int(5),
                ],
            ],
        ),
    );
    let mapper = r#"
<mapper namespace="app.OrderMapper">
  <resultMap id="itemMap" type="map">
    <id property="sku" column="item_sku"/>
    <result property="qty" column="item_qty"/>
  </resultMap>
  <resultMap id="orderMap" type="map" autoMapping="false">
    <id property="id" column="id"/>
    <result property="buyer" column="buyer"/>
    <collection property="items" resultMap="itemMap"/>
  </resultMap>
  <select id="selectOrders" resultMap="orderMap" resultOrdered="true">
    select * from orders
  </select>
</mapper>
"#;
    let config = CONFIG.replace("users.xml", "orders.xml");
    let factory = factory_with(&driver, &config, &[("orders.xml", mapper)]);
    let mut session = factory.open_session().unwrap();

    let orders: Vec<Value> = session
        .select_list("app.OrderMapper.selectOrders", ())
        .unwrap();
    assert_eq!(orders.len(), 2);
    assert_eq!(orders[0].get("buyer"), Some(&Value::Str("ada".into())));
    assert_eq!(orders[0].get("items").unwrap().len(), Some(2));
    assert_eq!(orders[1].get("items").unwrap().len(), Some(1));
}

#[test]
fn nested_selects_run_eagerly_per_row() {
    let driver = MemoryDriver::new();
    driver.respond_rows(
        "from authors",
        MemoryDriver::rows(
            &["id", "name"],
            &[&[Value::Int(1), Value::Str("ada".into())]],
        ),
    );
    driver.respond_rows(
        "from books where author_id",
        MemoryDriver::rows(
            &["title"],
            &[
                &[Value::Str("one".into())],
                &[Value::Str("two".into())],
            ],
        ),
    );
    let mapper = r#"
<mapper namespace="app.AuthorMapper">
  <resultMap id="authorMap" type="map">
    <id property="id" column="id"/>
    <result property="name" column="name"/>
    <collection property="books" column="id" select="selectBooks"/>
  </resultMap>
  <select id="selectAuthors" resultMap="authorMap">select * from authors</select>
  <select id="selectBooks" resultType="map">select * from books where author_id = #{id}</select>
</mapper>
"#;
    let config = CONFIG.replace("users.xml", "authors.xml");
    let factory = factory_with(&driver, &config, &[("authors.xml", mapper)]);
    let mut session = factory.open_session().unwrap();

    let authors: Vec<Value> = session
        .select_list("app.AuthorMapper.selectAuthors", ())
        .unwrap();
    assert_eq!(authors.len(), 1);
    let books = authors[0].get("books").unwrap();
    assert_eq!(books.len(), Some(2));
}

#[test]
fn discriminator_switches_result_maps_per_row() {
    let driver = MemoryDriver::new();
    driver.respond_rows(
        "from vehicles",
        MemoryDriver::rows(
            &["id", "kind", "doors", "cc"],
            &[
                &[
                    Value::Int(1),
                    Value::Str("car".into()),
                    Value::Int(5),
                    Value::Null,
                ],
                &[
                    Value::Int(2),
                    Value::Str("bike".into()),
                    Value::Null,
                    Value::Int(600),
                ],
            ],
        ),
    );
    let mapper = r#"
<mapper namespace="app.VehicleMapper">
  <resultMap id="carMap" type="map" autoMapping="false">
    <id property="id" column="id"/>
    <result property="doors" column="doors"/>
  </resultMap>
  <resultMap id="bikeMap" type="map" autoMapping="false">
    <id property="id" column="id"/>
    <result property="cc" column="cc"/>
  </resultMap>
  <resultMap id="vehicleMap" type="map" autoMapping="false">
    <id property="id" column="id"/>
    <discriminator javaType="string" column="kind">
      <case value="car" resultMap="carMap"/>
      <case value="bike" resultMap="bikeMap"/>
    </discriminator>
  </resultMap>
  <select id="selectVehicles" resultMap="vehicleMap">select * from vehicles</select>
</mapper>
"#;
    let config = CONFIG.replace("users.xml", "vehicles.xml");
    let factory = factory_with(&driver, &config, &[("vehicles.xml", mapper)]);
    let mut session = factory.open_session().unwrap();

    let vehicles: Vec<Value> = session
        .select_list("app.VehicleMapper.selectVehicles", ())
        .unwrap();
    assert_eq!(vehicles[0].get("doors"), Some(&Value::Int(5)));
    assert!(vehicles[0].get("cc").is_none());
    assert_eq!(vehicles[1].get("cc"), Some(&Value::Int(600)));
}
